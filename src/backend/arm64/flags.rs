//! Process-wide emission switches.
//!
//! Every fusion can be disabled independently, and every fusion can
//! trace its attempts to stderr. The switches are read from the
//! environment exactly once, at first use; emission never consults the
//! environment directly.

use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct EmitCfg {
    pub madd: bool,
    pub shift: bool,
    pub ldp_stp: bool,
    pub indexed: bool,
    pub cbz: bool,
    /// Consumed by the upstream vectorizer; carried here so all switches
    /// have a single seed point.
    pub neon_copy: bool,
    pub neon_arith: bool,
    pub dbg_madd: bool,
    pub dbg_shift: bool,
    pub dbg_ldp_stp: bool,
    pub dbg_indexed: bool,
}

/// "1" or "true" enables; any other value disables; unset enables.
fn enabled(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1" || v == "true",
        Err(_) => true,
    }
}

/// Any value at all turns a debug trace on.
fn tracing(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

impl EmitCfg {
    pub fn from_env() -> EmitCfg {
        EmitCfg {
            madd: enabled("ENABLE_MADD_FUSION"),
            shift: enabled("ENABLE_SHIFT_FUSION"),
            ldp_stp: enabled("ENABLE_LDP_STP_FUSION"),
            indexed: enabled("ENABLE_INDEXED_ADDR"),
            cbz: enabled("ENABLE_CBZ_FUSION"),
            neon_copy: enabled("ENABLE_NEON_COPY"),
            neon_arith: enabled("ENABLE_NEON_ARITH"),
            dbg_madd: tracing("DEBUG_MADD"),
            dbg_shift: tracing("DEBUG_SHIFT_FUSION"),
            dbg_ldp_stp: tracing("DEBUG_LDP_STP"),
            dbg_indexed: tracing("DEBUG_INDEXED_ADDR"),
        }
    }

    /// Everything on, nothing traced. What `from_env` yields in a clean
    /// environment.
    pub fn all_fusions() -> EmitCfg {
        EmitCfg {
            madd: true,
            shift: true,
            ldp_stp: true,
            indexed: true,
            cbz: true,
            neon_copy: true,
            neon_arith: true,
            dbg_madd: false,
            dbg_shift: false,
            dbg_ldp_stp: false,
            dbg_indexed: false,
        }
    }

    /// Every fusion disabled; emission is then a straight per-instruction
    /// rendering.
    pub fn no_fusions() -> EmitCfg {
        EmitCfg {
            madd: false,
            shift: false,
            ldp_stp: false,
            indexed: false,
            cbz: false,
            ..EmitCfg::all_fusions()
        }
    }

    /// The process-wide configuration, seeded from the environment on
    /// first access.
    pub fn global() -> &'static EmitCfg {
        static GLOBAL: Lazy<EmitCfg> = Lazy::new(EmitCfg::from_env);
        &GLOBAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_means_enabled() {
        std::env::remove_var("ENABLE_MADD_FUSION");
        assert!(enabled("ENABLE_MADD_FUSION"));
    }

    #[test]
    fn only_one_and_true_enable() {
        std::env::set_var("ACG_TEST_FLAG", "1");
        assert!(enabled("ACG_TEST_FLAG"));
        std::env::set_var("ACG_TEST_FLAG", "true");
        assert!(enabled("ACG_TEST_FLAG"));
        std::env::set_var("ACG_TEST_FLAG", "yes");
        assert!(!enabled("ACG_TEST_FLAG"));
        std::env::set_var("ACG_TEST_FLAG", "0");
        assert!(!enabled("ACG_TEST_FLAG"));
        std::env::remove_var("ACG_TEST_FLAG");
    }

    #[test]
    fn any_value_turns_tracing_on() {
        std::env::set_var("ACG_TEST_TRACE", "0");
        assert!(tracing("ACG_TEST_TRACE"));
        std::env::remove_var("ACG_TEST_TRACE");
        assert!(!tracing("ACG_TEST_TRACE"));
    }
}

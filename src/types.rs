//! Type definitions, enums and bridge options.

use std::os::raw::c_int;

use crate::error::{Error, Result};
use crate::ffi::{METH_KEYWORDS, METH_NOARGS, METH_O, METH_VARARGS};

/// What a shim does when handed a null, stale or foreign handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidHandlePolicy {
    /// Panic at the point of use. Inside an `extern "C"` shim this aborts.
    Trap,
    /// Set a pending SystemError and return the failure sentinel.
    Report,
}

impl Default for InvalidHandlePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            InvalidHandlePolicy::Trap
        } else {
            InvalidHandlePolicy::Report
        }
    }
}

/// How a native method receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// `f(ctx, self)`
    NoArgs,
    /// `f(ctx, self, arg)`
    O,
    /// `f(ctx, self, args, nargs)`
    VarArgs,
    /// `f(ctx, self, args, nargs, kw)`
    Keywords,
}

impl CallingConvention {
    /// Decode method flags. Returns `None` for invalid combinations.
    pub fn from_flags(flags: c_int) -> Option<Self> {
        match flags {
            METH_NOARGS => Some(CallingConvention::NoArgs),
            METH_O => Some(CallingConvention::O),
            METH_VARARGS => Some(CallingConvention::VarArgs),
            f if f == METH_VARARGS | METH_KEYWORDS => Some(CallingConvention::Keywords),
            _ => None,
        }
    }
}

impl From<CallingConvention> for c_int {
    fn from(conv: CallingConvention) -> c_int {
        match conv {
            CallingConvention::NoArgs => METH_NOARGS,
            CallingConvention::O => METH_O,
            CallingConvention::VarArgs => METH_VARARGS,
            CallingConvention::Keywords => METH_VARARGS | METH_KEYWORDS,
        }
    }
}

/// Options for creating a bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Maximum number of live handles, singletons included (default: 1048576).
    pub max_handles: usize,
    /// Number of independently locked table shards, a power of two up to 64
    /// (default: 16).
    pub shards: usize,
    /// Reaction to invalid handle arguments (default: trap in debug builds).
    pub invalid_handle: InvalidHandlePolicy,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_handles: 1 << 20,
            shards: 16,
            invalid_handle: InvalidHandlePolicy::default(),
        }
    }
}

/// Environment variable overriding [`BridgeOptions::max_handles`].
pub const ENV_MAX_HANDLES: &str = "HBRIDGE_MAX_HANDLES";
/// Environment variable overriding [`BridgeOptions::shards`].
pub const ENV_SHARDS: &str = "HBRIDGE_SHARDS";
/// Environment variable selecting [`InvalidHandlePolicy::Trap`] when true.
pub const ENV_TRAP_INVALID_HANDLES: &str = "HBRIDGE_TRAP_INVALID_HANDLES";

impl BridgeOptions {
    /// Defaults overlaid with `HBRIDGE_*` environment variables.
    ///
    /// Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let trap = env_bool(
            ENV_TRAP_INVALID_HANDLES,
            defaults.invalid_handle == InvalidHandlePolicy::Trap,
        );
        Self {
            max_handles: env_u32_nonzero(ENV_MAX_HANDLES, defaults.max_handles as u32) as usize,
            shards: env_u32_nonzero(ENV_SHARDS, defaults.shards as u32) as usize,
            invalid_handle: if trap {
                InvalidHandlePolicy::Trap
            } else {
                InvalidHandlePolicy::Report
            },
        }
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_handles == 0 {
            return Err(Error::InvalidArgument(
                "max_handles must be non-zero".to_string(),
            ));
        }
        if !self.shards.is_power_of_two() || self.shards > 64 {
            return Err(Error::InvalidArgument(format!(
                "shards must be a power of two no larger than 64, got {}",
                self.shards
            )));
        }
        Ok(())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u32_nonzero(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&v| v != 0)
        .unwrap_or(default)
}

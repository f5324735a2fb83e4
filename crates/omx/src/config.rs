//! Process-wide tunables, read from the environment once at the first
//! successful [`init`](crate::init).
//!
//! Every knob accepts an `OMX_`-prefixed name and, for compatibility
//! with applications written against the original MX library, falls back
//! to the same name under the `MX_` prefix.

use std::env;
use std::sync::OnceLock;

use omx_driver::abi::{MEDIUM_MSG_LENGTH_MAX, SMALL_MAX};

/// Default bound on zombified requests per endpoint.
pub const ZOMBIE_MAX_DEFAULT: u32 = 512;

/// Default number of unacked seqnums that forces an immediate ack.
pub const NOT_ACKED_MAX_DEFAULT: u16 = 4;

/// Default bound on per-request retransmissions before the partner is
/// declared unreachable.
pub const RESENDS_MAX_DEFAULT: u32 = 1000;

/// Default rendezvous threshold for remote partners.
pub const RNDV_THRESHOLD_DEFAULT: u32 = 32768;

/// Delayed acks are flushed this many times per second.
pub const ACKS_PER_SECOND: u32 = 64;

/// Unacked requests are retransmitted this many times per second.
pub const RESENDS_PER_SECOND: u32 = 2;

/// Immutable snapshot of the environment tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbose diagnostics requested (`OMX_VERBOSE`).
    pub verbose: bool,
    /// Abort on request errors instead of reporting them
    /// (`OMX_FATAL_ERRORS`).
    pub fatal_errors: bool,
    /// Self-communication enabled (cleared by `OMX_DISABLE_SELF`).
    pub selfcomms: bool,
    /// Shared (intra-host) communication enabled (cleared by
    /// `OMX_DISABLE_SHARED`).
    pub sharedcomms: bool,
    /// Rendezvous threshold for remote partners (`OMX_RNDV_THRESHOLD`).
    pub rndv_threshold: u32,
    /// Rendezvous threshold for local partners
    /// (`OMX_SHARED_RNDV_THRESHOLD`), bounded to
    /// `[SMALL_MAX + 1, MEDIUM_MSG_LENGTH_MAX]`.
    pub shared_rndv_threshold: u32,
    /// Retransmission bound (`OMX_RESENDS_MAX`).
    pub resends_max: u32,
    /// Zombie bound per endpoint (`OMX_ZOMBIE_SEND`).
    pub zombie_max: u32,
    /// Unacked-seqnum count that forces an immediate ack
    /// (`OMX_NOTACKED_MAX`).
    pub not_acked_max: u16,
    /// Busy-poll instead of sleeping in waits (`OMX_WAITSPIN`).
    pub waitspin: bool,
    /// Let signals interrupt waits (`OMX_WAITINTR`).
    pub waitintr: bool,
    /// Stage medium sends through the mapped send queue instead of
    /// posting them from user memory (`OMX_MEDIUM_SENDQ`).
    pub medium_sendq: bool,
    /// Region registration cache enabled (`OMX_RCACHE`).
    pub regcache: bool,
    /// Allow concurrent users of one cached region (`OMX_PRCACHE`).
    pub parallel_regcache: bool,
    /// Context-id bits carved out of the match space (`OMX_CTXIDS`,
    /// `bits,shift`).
    pub ctxid_bits: u8,
    /// Shift of the context-id field inside the match info.
    pub ctxid_shift: u8,
    /// Process binding description file knob (`OMX_PROCESS_BINDING`).
    pub process_binding: Option<String>,
}

/// Advisory peer-binding file written by the cluster preparation tools.
pub const PROCESS_BINDING_FILE: &str = "/tmp/open-mx.bindings.dat";

fn env_var(name: &str) -> Option<String> {
    env::var(format!("OMX_{name}"))
        .or_else(|_| env::var(format!("MX_{name}")))
        .ok()
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name).map_or(default, |v| v != "0")
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_var(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        let shared_rndv_threshold = env_u32("SHARED_RNDV_THRESHOLD", 4096)
            .clamp(SMALL_MAX as u32 + 1, MEDIUM_MSG_LENGTH_MAX as u32);

        let (ctxid_bits, ctxid_shift) = env_var("CTXIDS")
            .and_then(|v| {
                let (bits, shift) = v.split_once(',')?;
                Some((bits.trim().parse().ok()?, shift.trim().parse().ok()?))
            })
            .filter(|&(bits, shift): &(u8, u8)| bits <= 16 && u32::from(bits) + u32::from(shift) <= 64)
            .unwrap_or((0, 0));

        Self {
            verbose: env_bool("VERBOSE", false),
            fatal_errors: env_bool("FATAL_ERRORS", false),
            selfcomms: !env_bool("DISABLE_SELF", false),
            sharedcomms: !env_bool("DISABLE_SHARED", false),
            rndv_threshold: env_u32("RNDV_THRESHOLD", RNDV_THRESHOLD_DEFAULT)
                .clamp(SMALL_MAX as u32 + 1, MEDIUM_MSG_LENGTH_MAX as u32),
            shared_rndv_threshold,
            resends_max: env_u32("RESENDS_MAX", RESENDS_MAX_DEFAULT),
            zombie_max: env_u32("ZOMBIE_SEND", ZOMBIE_MAX_DEFAULT),
            not_acked_max: env_u32("NOTACKED_MAX", u32::from(NOT_ACKED_MAX_DEFAULT)) as u16,
            waitspin: env_bool("WAITSPIN", false),
            waitintr: env_bool("WAITINTR", false),
            medium_sendq: env_bool("MEDIUM_SENDQ", true),
            regcache: env_bool("RCACHE", true),
            parallel_regcache: env_bool("PRCACHE", false),
            ctxid_bits,
            ctxid_shift,
            process_binding: env_var("PROCESS_BINDING"),
        }
    }

    /// The process-wide snapshot; the environment is read exactly once,
    /// on first use.
    pub fn get() -> &'static Self {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Self::from_env)
    }

    /// Delayed-ack flush interval for a driver ticking at `hz`.
    #[must_use]
    pub fn ack_delay_jiffies(hz: u32) -> u64 {
        u64::from((hz + ACKS_PER_SECOND) / ACKS_PER_SECOND)
    }

    /// Retransmission interval for a driver ticking at `hz`.
    #[must_use]
    pub fn resend_delay_jiffies(hz: u32) -> u64 {
        u64::from((hz + RESENDS_PER_SECOND) / RESENDS_PER_SECOND)
    }

    /// Converts a user-facing millisecond timeout into a resend budget,
    /// assuming 1 s == 1024 ms to keep the division cheap.
    #[must_use]
    pub fn timeout_ms_to_resends(ms: u32) -> u32 {
        (ms * RESENDS_PER_SECOND + 1023) / 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::get();
        assert!(config.rndv_threshold > SMALL_MAX as u32);
        assert!(config.shared_rndv_threshold <= MEDIUM_MSG_LENGTH_MAX as u32);
        assert_eq!(config.zombie_max, ZOMBIE_MAX_DEFAULT);
    }

    #[test]
    fn timeout_conversion_rounds_up() {
        assert_eq!(Config::timeout_ms_to_resends(0), 0);
        assert_eq!(Config::timeout_ms_to_resends(1), 1);
        assert_eq!(Config::timeout_ms_to_resends(1024), 2);
    }
}

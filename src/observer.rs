// Per-volume diagnostics sink: a capability owned by (or shared into)
// exactly one volume, so opening several volumes concurrently never
// interleaves their event streams through shared mutable state.

use crate::metadata::ProtectionType;

/// One notable event during a volume's open/unlock/read lifecycle.
#[derive(Debug, Clone)]
pub enum Event {
    /// The boot sector parsed successfully.
    HeaderParsed,
    /// An FVE metadata block was selected among the (up to three) copies.
    MetadataBlockChosen { sequence_number: u64 },
    /// One (credential, protector) pair was attempted during unlock.
    ProtectorAttempted {
        protector_id: String,
        protection_type: ProtectionType,
        succeeded: bool,
    },
    /// Unlock succeeded; sector decryption is now available.
    Unlocked { method: &'static str },
    /// Periodic sector-cache hit/miss counters.
    CacheStats { hits: u64, misses: u64 },
}

/// A sink for `Event`s. Implementations must be `Send + Sync` since a
/// `Volume` may be handed to another thread after unlock.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: Event);
}

/// The default observer, used whenever `OpenOptions` supplies none. Forwards
/// every event to the `log` facade: `info` for lifecycle milestones, `debug`
/// for per-protector attempts, `trace` for cache statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_event(&self, event: Event) {
        match event {
            Event::HeaderParsed => log::info!("bde: volume header parsed"),
            Event::MetadataBlockChosen { sequence_number } => {
                log::info!("bde: selected FVE metadata block, sequence_number={}", sequence_number)
            }
            Event::ProtectorAttempted {
                protector_id,
                protection_type,
                succeeded,
            } => log::debug!(
                "bde: protector {} ({:?}) unlock attempt: {}",
                protector_id,
                protection_type,
                if succeeded { "succeeded" } else { "failed" }
            ),
            Event::Unlocked { method } => log::info!("bde: volume unlocked, encryption method {}", method),
            Event::CacheStats { hits, misses } => log::trace!("bde: sector cache hits={} misses={}", hits, misses),
        }
    }
}

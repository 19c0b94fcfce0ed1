//! Decoder cache keyed by [`TrackIdentity`], with lease-based reference counting.
//!
//! Lookups share the read lock. Inserting a new decoder and evicting idle ones take the
//! write lock, and a lease is always taken while one of the two locks is held, so
//! eviction can never race a caller that just found the decoder.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, RwLock};

use crate::config::DecoderSettings;
use crate::decode::TrackDecoder;
use crate::source::{SourceProvider, TrackIdentity};
use crate::sync::{OpenGate, read, write};

/// Keeps a decoder alive and out of eviction while held.
pub struct DecoderLease {
    decoder: Arc<TrackDecoder>,
}

impl DecoderLease {
    fn new(decoder: Arc<TrackDecoder>) -> Self {
        decoder.retain();
        Self { decoder }
    }

    pub fn same_decoder(&self, other: &DecoderLease) -> bool {
        Arc::ptr_eq(&self.decoder, &other.decoder)
    }
}

impl Clone for DecoderLease {
    fn clone(&self) -> Self {
        Self::new(self.decoder.clone())
    }
}

impl Deref for DecoderLease {
    type Target = TrackDecoder;

    fn deref(&self) -> &TrackDecoder {
        &self.decoder
    }
}

impl Drop for DecoderLease {
    fn drop(&mut self) {
        self.decoder.release();
    }
}

impl std::fmt::Debug for DecoderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderLease")
            .field("track", &self.decoder.identity().cache_key())
            .field("refs", &self.decoder.ref_count())
            .finish()
    }
}

/// Every live decoder, one per identity.
pub struct DecoderCache {
    decoders: RwLock<HashMap<TrackIdentity, Arc<TrackDecoder>>>,
    provider: Arc<dyn SourceProvider>,
    gate: Arc<OpenGate>,
    settings: DecoderSettings,
}

impl DecoderCache {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        settings: DecoderSettings,
        max_open_decoders: usize,
    ) -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
            provider,
            gate: OpenGate::new(max_open_decoders),
            settings,
        }
    }

    /// Lease the decoder for `identity`, creating an unopened one on a miss.
    ///
    /// A failed decoder nobody holds is replaced, so re-queueing a track retries it.
    pub fn acquire(&self, identity: &TrackIdentity) -> DecoderLease {
        if let Some(lease) = self.lookup(identity) {
            return lease;
        }

        let mut replaced = None;
        let lease = {
            let mut decoders = write(&self.decoders);
            match decoders.get(identity) {
                Some(d) if !Self::replaceable(d) => DecoderLease::new(d.clone()),
                _ => {
                    let decoder = Arc::new(TrackDecoder::new(
                        identity.clone(),
                        self.provider.clone(),
                        self.gate.clone(),
                        self.settings.clone(),
                    ));
                    replaced = decoders.insert(identity.clone(), decoder.clone());
                    DecoderLease::new(decoder)
                }
            }
        };
        if let Some(old) = replaced {
            tracing::debug!(track = %identity.cache_key(), "replacing failed decoder");
            drop(old);
        }
        lease
    }

    /// Lease an existing decoder without creating one.
    pub fn lookup(&self, identity: &TrackIdentity) -> Option<DecoderLease> {
        let decoders = read(&self.decoders);
        decoders
            .get(identity)
            .filter(|d| !Self::replaceable(d))
            .map(|d| DecoderLease::new(d.clone()))
    }

    fn replaceable(decoder: &Arc<TrackDecoder>) -> bool {
        decoder.is_error() && Self::idle(decoder)
    }

    /// No lease counts it and no dropping lease still holds it, so the map's
    /// handle is the last one and the decoder is never torn down elsewhere.
    fn idle(decoder: &Arc<TrackDecoder>) -> bool {
        decoder.ref_count() == 0 && Arc::strong_count(decoder) == 1
    }

    /// Close every unleased decoder whose identity is not in `keep`.
    ///
    /// Decoders are closed after the write lock is released. Returns how many were evicted.
    pub fn evict_unreferenced(&self, keep: &HashSet<TrackIdentity>) -> usize {
        let evicted: Vec<Arc<TrackDecoder>> = {
            let mut decoders = write(&self.decoders);
            let doomed: Vec<TrackIdentity> = decoders
                .iter()
                .filter(|(id, d)| Self::idle(d) && !keep.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();
            doomed
                .iter()
                .filter_map(|id| decoders.remove(id))
                .collect()
        };
        for decoder in &evicted {
            tracing::debug!(track = %decoder.identity().cache_key(), "evicting decoder");
        }
        let count = evicted.len();
        drop(evicted);
        count
    }

    #[cfg(test)]
    pub fn contains(&self, identity: &TrackIdentity) -> bool {
        read(&self.decoders).contains_key(identity)
    }

    pub fn len(&self) -> usize {
        read(&self.decoders).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every decoder, leased or not, and empty the cache.
    ///
    /// Used at shutdown so opens still retrying in helper threads give up.
    pub fn close_all(&self) {
        let all: Vec<_> = write(&self.decoders).drain().map(|(_, d)| d).collect();
        for decoder in &all {
            decoder.close();
        }
    }
}

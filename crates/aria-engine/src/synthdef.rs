//! Synth definition registry
//!
//! Definitions are registered on the worker (or the loading thread) and
//! looked up on the audio thread. Publication uses `ArcSwap`: writers
//! clone-and-swap the whole map, readers take a lock-free snapshot, so
//! the audio thread never blocks and never allocates beyond the `Arc`
//! bump of the entry it resolves.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use aria_core::{EngineError, EngineResult};
use aria_plugin::{SynthDef, MAX_OPTIONS_ALIGN, MAX_OPTIONS_SIZE};

pub(crate) struct SynthDefRegistry {
    defs: ArcSwap<HashMap<&'static str, Arc<SynthDef>>>,
}

impl SynthDefRegistry {
    pub fn new() -> Self {
        Self {
            defs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Register a definition under its URI; later registrations replace
    /// earlier ones
    pub fn register(&self, def: SynthDef) -> EngineResult<()> {
        if def.options_size > MAX_OPTIONS_SIZE
            || def.options_align > MAX_OPTIONS_ALIGN
            || !def.instance_align.max(1).is_power_of_two()
        {
            return Err(EngineError::InvalidArgument);
        }
        let uri = def.uri;
        let def = Arc::new(def);
        self.defs.rcu(|defs| {
            let mut defs = HashMap::clone(defs);
            defs.insert(uri, def.clone());
            defs
        });
        log::info!("registered synthdef {uri}");
        Ok(())
    }

    /// Lock-free lookup, safe on the audio thread
    pub fn lookup(&self, uri: &str) -> Option<Arc<SynthDef>> {
        self.defs.load().get(uri).cloned()
    }
}

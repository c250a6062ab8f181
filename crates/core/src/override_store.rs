use std::sync::{PoisonError, RwLock};

// Setting the slot does not start a resolution run.
#[derive(Debug, Default)]
pub struct ManualOverrideStore {
    slot: RwLock<Option<String>>,
}

impl ManualOverrideStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, descriptor: impl Into<String>) {
        let descriptor = descriptor.into();
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = (!descriptor.trim().is_empty()).then_some(descriptor);
    }

    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

use tokio::sync::watch;

/// Lock state of the signing backend.
pub trait KeyringState: Send + Sync {
    fn is_unlocked(&self) -> bool;

    /// Receiver that observes every lock/unlock transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Keyring state held as a single flag.
pub struct KeyringFlag {
    tx: watch::Sender<bool>,
}

impl KeyringFlag {
    pub fn new(unlocked: bool) -> Self {
        let (tx, _) = watch::channel(unlocked);
        Self { tx }
    }

    pub fn set_unlocked(&self, unlocked: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != unlocked;
            *current = unlocked;
            changed
        });
    }
}

impl KeyringState for KeyringFlag {
    fn is_unlocked(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

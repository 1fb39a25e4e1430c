//! Notification surface: best-effort, asynchronous callbacks the
//! bridge routes to the kernel through the transport. The bridge never
//! blocks on these.

use crate::attr::Ino;

/// Consumed by the bridge; implemented by the transport adapter that owns
/// the actual kernel channel.
pub trait Notifier: Send + Sync {
    /// Tells the kernel to drop its cached resolution of `(parent, name)`.
    fn notify_entry(&self, parent: Ino, name: &str);

    /// Tells the kernel a byte range of `ino`'s data changed. Safe to call
    /// on an inode the kernel has already closed.
    fn notify_content(&self, ino: Ino, offset: i64, len: i64);

    /// Tells the kernel that `name` vanished from `parent`.
    fn notify_delete(&self, parent: Ino, child: Ino, name: &str);
}

/// A [`Notifier`] that drops every notification. Used as the default when a
/// bridge is built without a transport attached (e.g. in unit tests).
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_entry(&self, _parent: Ino, _name: &str) {}
    fn notify_content(&self, _ino: Ino, _offset: i64, _len: i64) {}
    fn notify_delete(&self, _parent: Ino, _child: Ino, _name: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub struct CountingNotifier {
        pub entry_calls: AtomicUsize,
        pub content_calls: AtomicUsize,
        pub delete_calls: AtomicUsize,
    }

    impl CountingNotifier {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                entry_calls: AtomicUsize::new(0),
                content_calls: AtomicUsize::new(0),
                delete_calls: AtomicUsize::new(0),
            })
        }
    }

    impl Notifier for CountingNotifier {
        fn notify_entry(&self, _parent: Ino, _name: &str) {
            self.entry_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_content(&self, _ino: Ino, _offset: i64, _len: i64) {
            self.content_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_delete(&self, _parent: Ino, _child: Ino, _name: &str) {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn null_notifier_accepts_everything() {
        let notifier = NullNotifier;
        notifier.notify_entry(Ino::ROOT, "x");
        notifier.notify_content(Ino::ROOT, 0, 10);
        notifier.notify_delete(Ino::ROOT, Ino::new(2), "x");
    }
}

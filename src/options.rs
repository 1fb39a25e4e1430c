//! Defaults and option plumbing: timeout fill, default-permission inference,
//! the automatic inode allocator.

use std::time::Duration;

use crate::attr::DEFAULT_AUTOMATIC_INO_START;
use crate::inode::Inode;

/// Mount-wide configuration, filled in by the bridge on every reply.
pub struct Options {
    /// How long the kernel may cache a positive entry lookup. `None` lets
    /// the kernel apply its own default.
    pub entry_timeout: Option<Duration>,
    /// How long the kernel may cache attributes. `None` lets the kernel
    /// apply its own default.
    pub attr_timeout: Option<Duration>,
    /// How long the kernel may cache a negative (not-found) lookup.
    pub negative_timeout: Option<Duration>,
    /// First value handed out by the automatic inode allocator.
    pub automatic_ino_start: u64,
    /// When set, ACCESS falls back to a traditional UNIX permission check
    /// using GETATTR's result and the caller's uid/gid rather than
    /// returning "not supported".
    pub default_permissions: bool,
    /// Overrides applied to a handler's reported uid/gid when the handler
    /// left them at zero (the common "use the mount's uid/gid" idiom).
    pub default_uid: Option<u32>,
    pub default_gid: Option<u32>,
    /// Invoked once, immediately after the root inode is linked into the
    /// bridge.
    pub on_add_root: Option<Box<dyn Fn(&Inode) + Send + Sync>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            entry_timeout: None,
            attr_timeout: None,
            negative_timeout: None,
            automatic_ino_start: DEFAULT_AUTOMATIC_INO_START,
            default_permissions: false,
            default_uid: None,
            default_gid: None,
            on_add_root: None,
        }
    }
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// Small builder, in the style of `lnxdrive-core::config::FuseConfig`'s
/// construction helpers.
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn entry_timeout(mut self, timeout: Duration) -> Self {
        self.options.entry_timeout = Some(timeout);
        self
    }

    pub fn attr_timeout(mut self, timeout: Duration) -> Self {
        self.options.attr_timeout = Some(timeout);
        self
    }

    pub fn negative_timeout(mut self, timeout: Duration) -> Self {
        self.options.negative_timeout = Some(timeout);
        self
    }

    pub fn automatic_ino_start(mut self, start: u64) -> Self {
        self.options.automatic_ino_start = start;
        self
    }

    pub fn default_permissions(mut self, enabled: bool) -> Self {
        self.options.default_permissions = enabled;
        self
    }

    pub fn default_uid(mut self, uid: u32) -> Self {
        self.options.default_uid = Some(uid);
        self
    }

    pub fn default_gid(mut self, gid: u32) -> Self {
        self.options.default_gid = Some(gid);
        self
    }

    pub fn on_add_root(mut self, hook: impl Fn(&Inode) + Send + Sync + 'static) -> Self {
        self.options.on_add_root = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_automatic_ino_start_avoids_low_numbers() {
        let options = Options::default();
        assert_eq!(options.automatic_ino_start, DEFAULT_AUTOMATIC_INO_START);
        assert!(options.automatic_ino_start > 2);
    }

    #[test]
    fn builder_overrides_defaults() {
        let options = Options::builder()
            .entry_timeout(Duration::from_secs(2))
            .negative_timeout(Duration::from_secs(1))
            .default_permissions(true)
            .build();
        assert_eq!(options.entry_timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.negative_timeout, Some(Duration::from_secs(1)));
        assert!(options.default_permissions);
    }
}

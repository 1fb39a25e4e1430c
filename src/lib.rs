//! In-memory inode graph and request bridge for building FUSE filesystems.
//!
//! A node author implements [`ops::Operations`] per node type and wires the
//! tree together by returning [`ops::NodeReply`] from `lookup`/`mkdir`/etc.
//! [`bridge::Bridge`] owns the inode graph, the handle table, and automatic
//! inode numbering, and turns kernel-visible inode/handle numbers into calls
//! against the right node's `Operations` implementation.
//!
//! The crate never touches a kernel channel itself. [`raw::RawFileSystem`] is
//! the sink a transport adapter calls into; [`notify::Notifier`] is the
//! callback surface the bridge uses to push asynchronous invalidations back
//! out. Wiring either of those to an actual mount is left to the embedder.

pub mod attr;
pub mod bridge;
pub mod context;
pub mod dirstream;
pub mod error;
pub mod handle;
pub mod inode;
pub mod notify;
pub mod ops;
pub mod options;
pub mod raw;

pub use attr::{Ino, StableAttr};
pub use bridge::Bridge;
pub use context::{CallerId, RequestContext};
pub use dirstream::{DirEntry, DirStream, VecDirStream};
pub use error::{Errno, OpResult};
pub use handle::Fh;
pub use inode::Inode;
pub use notify::{NullNotifier, Notifier};
pub use ops::{Attr, AttrChange, Capabilities, NodeReply, OpenReply, Operations};
pub use options::Options;
pub use raw::RawFileSystem;

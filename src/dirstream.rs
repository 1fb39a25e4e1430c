//! Directory stream machinery: lazy iteration, overflow stashing,
//! offset-keyed resume.

use crate::attr::Ino;
use crate::error::OpResult;

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Never empty, never contains an embedded NUL, never `/`.
    pub name: String,
    pub ino: Ino,
    /// File-type bits only.
    pub mode: u32,
    pub off: u64,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, ino: impl Into<Ino>, mode: u32, off: u64) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty() && name != "/" && !name.contains('\0'));
        Self {
            name,
            ino: ino.into(),
            mode,
            off,
        }
    }
}

/// Lazy iterator over a directory's entries, handed back by
/// [`Operations::open_directory`](crate::ops::Operations::open_directory).
pub trait DirStream: Send {
    fn has_next(&mut self) -> bool;

    /// Only called when `has_next` most recently returned `true`.
    fn next(&mut self) -> OpResult<DirEntry>;

    /// Idempotent; may be called on a stream whose iteration errored out.
    fn close(&mut self) {}

    /// Optional resume support. When present and the kernel reissues a read
    /// at a non-zero offset while this stream instance is still alive, the
    /// bridge calls `seek` instead of discarding the stream and restarting.
    fn seek(&mut self, _offset: u64) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("seek"))
    }

    fn supports_seek(&self) -> bool {
        false
    }
}

/// An in-memory directory stream over a fixed `Vec<DirEntry>`, useful for
/// handlers whose full listing is cheap to materialize up front. Supports
/// `seek` trivially since the whole listing is already resident.
pub struct VecDirStream {
    entries: std::vec::IntoIter<DirEntry>,
    all: Vec<DirEntry>,
    position: usize,
}

impl VecDirStream {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self {
            entries: entries.clone().into_iter(),
            all: entries,
            position: 0,
        }
    }
}

impl DirStream for VecDirStream {
    fn has_next(&mut self) -> bool {
        self.position < self.all.len()
    }

    fn next(&mut self) -> OpResult<DirEntry> {
        let entry = self
            .entries
            .next()
            .ok_or_else(|| crate::error::Errno::Invalid("directory stream exhausted".into()))?;
        self.position += 1;
        Ok(entry)
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, offset: u64) -> OpResult<()> {
        let skip = offset as usize;
        self.position = skip.min(self.all.len());
        self.entries = self.all[self.position..].to_vec().into_iter();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<DirEntry> {
        (0..n)
            .map(|i| DirEntry::new(format!("e{i}"), (100 + i) as u64, crate::attr::S_IFREG, i as u64))
            .collect()
    }

    #[test]
    fn vec_stream_iterates_in_order() {
        let mut stream = VecDirStream::new(entries(3));
        let names: Vec<String> = std::iter::from_fn(|| {
            if stream.has_next() {
                Some(stream.next().unwrap().name)
            } else {
                None
            }
        })
        .collect();
        assert_eq!(names, vec!["e0", "e1", "e2"]);
    }

    #[test]
    fn vec_stream_seek_resumes_mid_listing() {
        let mut stream = VecDirStream::new(entries(5));
        stream.seek(3).unwrap();
        assert_eq!(stream.next().unwrap().name, "e3");
        assert_eq!(stream.next().unwrap().name, "e4");
        assert!(!stream.has_next());
    }
}

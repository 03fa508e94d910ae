//! Path and file-name types: byte strings with no NUL, names bounded by
//! the directory entry width.

use core::cmp;
use core::ffi::CStr;

use super::DIRSIZ;

#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters.
    // - The slice is not longer than DIRSIZ.
    inner: [u8],
}

impl FileName {
    /// Truncate bytes beyond the first DIRSIZ bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0));
        // SAFETY: `&FileName` is layout-compatible with `[u8]` thanks to
        // repr(transparent), and the slice satisfies the invariant.
        unsafe { &*(&bytes[..cmp::min(DIRSIZ, bytes.len())] as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]`, and
        // CStr::to_bytes contains no NUL.
        unsafe { &*(cstr.to_bytes() as *const [u8] as *const Self) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: layout-compatible per repr(transparent); no NUL per the
        // safety condition.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `Some((path, name))` where `name` is the next path element
    /// and `path` is the remainder with no leading slashes, so the caller
    /// can check `path.is_empty_string()` to see if the name is the last
    /// one. Returns `None` if there is no name to remove.
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or(bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let path = unsafe { Self::from_bytes(&bytes[next_start..]) };
        Some((path, name))
    }

    /// Whether the path begins with '/'.
    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(bytes: &[u8]) -> &Path {
        // SAFETY: test inputs contain no NUL.
        unsafe { Path::from_bytes(bytes) }
    }

    #[test]
    fn skipelem_walks_components() {
        let (rest, name) = path(b"a/bb/c").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb/c");

        let (rest, name) = path(b"///a//bb").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb");

        let (rest, name) = path(b"a").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert!(rest.is_empty_string());
    }

    #[test]
    fn skipelem_empty() {
        assert!(path(b"").skipelem().is_none());
        assert!(path(b"////").skipelem().is_none());
    }

    #[test]
    fn long_names_truncate_to_dirsiz() {
        let (_, name) = path(b"abcdefghijklmnopqr").skipelem().unwrap();
        assert_eq!(name.as_bytes().len(), DIRSIZ);
    }
}

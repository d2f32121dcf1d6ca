use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::SessionError;
use crate::protocol::ErrorCode;

/// A readable byte source served in response to an RRQ.
///
/// `size` reports the total number of bytes the target will yield, when
/// known; it backs the `tsize` option and may be expensive on the first
/// call (the netascii encoder materializes the transformed stream).
/// Release of the underlying resource is `Drop`.
pub trait ReadTarget: Read {
    fn size(&mut self) -> io::Result<Option<u64>>;
}

/// Factory for transfer targets, supplied by the embedder.
///
/// `open_write` receives the client-declared `tsize` (when sent) as a
/// preallocation hint. Both methods pick the TFTP error the peer sees by
/// returning `SessionError::Local`; plain I/O errors convert with the
/// default code mapping.
pub trait Handler: Send + Sync + 'static {
    type Reader: ReadTarget + Send + 'static;
    type Writer: Write + Send + 'static;

    fn open_read(&self, path: &str) -> Result<Self::Reader, SessionError>;
    fn open_write(&self, path: &str, size: Option<u64>) -> Result<Self::Writer, SessionError>;
}

/// Accumulate up to `blksize` bytes from a reader.
///
/// Short reads are retried until the block is full or the reader reports
/// EOF; an empty block is valid and marks the end of the transfer.
pub(crate) fn read_block<R: Read + ?Sized>(reader: &mut R, blksize: usize) -> io::Result<Vec<u8>> {
    let mut block = vec![0u8; blksize];
    let mut filled = 0;
    while filled < blksize {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    block.truncate(filled);
    Ok(block)
}

/// A regular file opened for reading, with its length captured at open time.
pub struct FileReader {
    file: File,
    len: Option<u64>,
}

impl FileReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata().ok().map(|meta| meta.len());
        Ok(FileReader { file, len })
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ReadTarget for FileReader {
    fn size(&mut self) -> io::Result<Option<u64>> {
        Ok(self.len)
    }
}

/// Serves a directory tree: downloads come from it, uploads land in it.
///
/// Request paths are confined to the root; uploads may create
/// subdirectories but never overwrite an existing file.
pub struct FsHandler {
    root: PathBuf,
    read_only: bool,
}

impl FsHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsHandler {
            root: root.into(),
            read_only: false,
        }
    }

    /// Reject all write requests with an access violation.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl Handler for FsHandler {
    type Reader = FileReader;
    type Writer = File;

    fn open_read(&self, path: &str) -> Result<FileReader, SessionError> {
        let path = resolve_path(&self.root, path)?;
        Ok(FileReader::open(&path)?)
    }

    fn open_write(&self, path: &str, size: Option<u64>) -> Result<File, SessionError> {
        if self.read_only {
            return Err(SessionError::local(
                ErrorCode::AccessViolation,
                "server is read-only",
            ));
        }
        let path = resolve_path(&self.root, path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(SessionError::from)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        if let Some(len) = size {
            file.set_len(len)?;
        }
        Ok(file)
    }
}

/// Map a request path onto the served root.
///
/// TFTP paths are free-form strings chosen by the client; only plain
/// relative components are honored. A path that is rooted, traverses
/// upward, or resolves outside the root through a symlink is answered
/// with an access violation. The file itself need not exist yet (WRQ),
/// in which case its deepest existing ancestor is what gets checked.
fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, SessionError> {
    // Some clients send backslash separators.
    let request = filename.replace('\\', "/");

    let mut relative = PathBuf::new();
    for component in Path::new(&request).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(SessionError::local(
                    ErrorCode::AccessViolation,
                    format!("{filename} is not relative to the served root"),
                ));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(SessionError::local(
            ErrorCode::AccessViolation,
            format!("{filename} names no file"),
        ));
    }

    let root = root.canonicalize()?;
    let full = root.join(relative);

    // The join cannot leave the root on its own, but a symlink inside the
    // tree still can; resolving the deepest existing ancestor catches
    // that.
    let anchor = full
        .ancestors()
        .find(|path| path.exists())
        .unwrap_or(root.as_path());
    let resolved = anchor.canonicalize()?;
    if !resolved.starts_with(&root) {
        return Err(SessionError::local(
            ErrorCode::AccessViolation,
            format!("{filename} escapes the served root"),
        ));
    }

    if anchor == full { Ok(resolved) } else { Ok(full) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The access-violation code a rejected resolution must carry.
    fn denied(result: Result<PathBuf, SessionError>) -> ErrorCode {
        match result {
            Err(SessionError::Local { code, .. }) => code,
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(path) => panic!("expected a rejection, resolved to {}", path.display()),
        }
    }

    #[test]
    fn resolve_serves_files_under_the_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("configs/switches")).unwrap();
        std::fs::write(root.path().join("configs/switches/sw1.cfg"), b"cfg").unwrap();

        let path = resolve_path(root.path(), "configs/switches/sw1.cfg").unwrap();
        assert!(path.ends_with("configs/switches/sw1.cfg"));

        // Backslash separators name the same file.
        let windows = resolve_path(root.path(), "configs\\switches\\sw1.cfg").unwrap();
        assert_eq!(windows, path);
    }

    #[test]
    fn resolve_keeps_new_upload_paths_inside_the_root() {
        let root = tempfile::tempdir().unwrap();
        let path = resolve_path(root.path(), "incoming/fresh.bin").unwrap();
        assert!(path.starts_with(root.path().canonicalize().unwrap()));
        assert!(path.ends_with("incoming/fresh.bin"));
    }

    #[test]
    fn resolve_rejects_escapes_with_an_access_violation() {
        let root = tempfile::tempdir().unwrap();
        for escape in ["/etc/passwd", "../sibling.bin", "a/../../b", "a\\..\\..\\b"] {
            assert_eq!(
                denied(resolve_path(root.path(), escape)),
                ErrorCode::AccessViolation,
                "{escape} must be refused"
            );
        }
    }

    #[test]
    fn resolve_rejects_requests_naming_no_file() {
        let root = tempfile::tempdir().unwrap();
        for empty in ["", ".", "./"] {
            assert_eq!(
                denied(resolve_path(root.path(), empty)),
                ErrorCode::AccessViolation,
                "{empty:?} must be refused"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlinks_leaving_the_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        assert_eq!(
            denied(resolve_path(root.path(), "link/secret.bin")),
            ErrorCode::AccessViolation
        );
    }

    #[test]
    fn open_read_missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FsHandler::new(dir.path());
        match handler.open_read("absent.bin") {
            Err(SessionError::Local { code, .. }) => assert_eq!(code, ErrorCode::FileNotFound),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn open_write_read_only_is_access_violation() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FsHandler::new(dir.path()).read_only(true);
        match handler.open_write("new.bin", None) {
            Err(SessionError::Local { code, .. }) => assert_eq!(code, ErrorCode::AccessViolation),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn open_write_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken.bin"), b"old").unwrap();
        let handler = FsHandler::new(dir.path());
        match handler.open_write("taken.bin", None) {
            Err(SessionError::Local { code, .. }) => assert_eq!(code, ErrorCode::FileExists),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn file_reader_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sized.bin"), vec![0u8; 1234]).unwrap();
        let mut reader = FileReader::open(&dir.path().join("sized.bin")).unwrap();
        assert_eq!(reader.size().unwrap(), Some(1234));
    }

    /// Reader that trickles one byte per call, to exercise accumulation.
    struct Trickle(Vec<u8>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0.remove(0);
            Ok(1)
        }
    }

    #[test]
    fn read_block_accumulates_short_reads() {
        let mut reader = Trickle(b"abcdefgh".to_vec());
        assert_eq!(read_block(&mut reader, 5).unwrap(), b"abcde");
        assert_eq!(read_block(&mut reader, 5).unwrap(), b"fgh");
        assert_eq!(read_block(&mut reader, 5).unwrap(), b"");
    }
}

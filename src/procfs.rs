//! The handful of `/proc` reads the monitor needs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Kernel clock ticks per second assumed for `utime`/`stime`.
pub const CLOCK_TICKS_PER_SEC: f64 = 100.0;

const FALLBACK_PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("process {0} not found")]
    NotFound(u32),

    #[error("malformed stat for process {pid}: {reason}")]
    Malformed { pid: u32, reason: String },

    #[error("I/O error reading process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Snapshot of the `/proc/<pid>/stat` fields used for a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcHeadline {
    pub rss_bytes: u64,
    pub vm_bytes: u64,
    pub utime_secs: f64,
    pub stime_secs: f64,
    pub num_threads: u64,
}

/// Parses the content of `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
pub fn parse_stat_headline(pid: u32, content: &str, page_size: u64) -> Result<ProcHeadline, ProcError> {
    let malformed = |reason: String| ProcError::Malformed { pid, reason };

    let close_paren = content
        .rfind(')')
        .ok_or_else(|| malformed("missing ')' after command name".into()))?;
    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();

    // Indices are relative to the state field (field 3 in proc(5)).
    let field = |idx: usize, name: &str| -> Result<u64, ProcError> {
        fields
            .get(idx)
            .ok_or_else(|| malformed(format!("missing {}", name)))?
            .parse::<i64>()
            .map(|v| v.max(0) as u64)
            .map_err(|_| malformed(format!("invalid {}", name)))
    };

    let utime = field(11, "utime")?;
    let stime = field(12, "stime")?;
    let num_threads = field(17, "num_threads")?;
    let vsize = field(20, "vsize")?;
    let rss_pages = field(21, "rss")?;

    Ok(ProcHeadline {
        rss_bytes: rss_pages.saturating_mul(page_size),
        vm_bytes: vsize,
        utime_secs: utime as f64 / CLOCK_TICKS_PER_SEC,
        stime_secs: stime as f64 / CLOCK_TICKS_PER_SEC,
        num_threads,
    })
}

/// The system page size, or 4 KiB if it cannot be queried.
pub fn system_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        FALLBACK_PAGE_SIZE
    }
}

fn numeric_entries(dir: &Path) -> io::Result<Vec<u32>> {
    let mut ids: Vec<u32> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Reader rooted at a procfs mount (normally `/proc`).
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    page_size: u64,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>, page_size: u64) -> Self {
        Self {
            root: root.into(),
            page_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Thread ids under `<root>/<pid>/task`, sorted. A vanished process has
    /// no threads.
    pub fn list_thread_ids(&self, pid: u32) -> Vec<u32> {
        numeric_entries(&self.root.join(pid.to_string()).join("task")).unwrap_or_default()
    }

    /// All numeric entries of the root, i.e. every visible pid.
    pub fn list_pids(&self) -> io::Result<Vec<u32>> {
        numeric_entries(&self.root)
    }

    pub fn read_headline(&self, pid: u32) -> Result<ProcHeadline, ProcError> {
        let content = self.read(pid, "stat")?;
        parse_stat_headline(pid, &content, self.page_size)
    }

    /// The command line with NUL separators turned into spaces, or the
    /// bracketed `comm` for processes without one (kernel threads).
    pub fn read_command_line(&self, pid: u32) -> Result<String, ProcError> {
        let raw = self.read(pid, "cmdline")?;
        let line = raw
            .split('\0')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !line.is_empty() {
            return Ok(line);
        }
        let comm = self.read(pid, "comm")?;
        Ok(format!("[{}]", comm.trim_end()))
    }

    fn read(&self, pid: u32, file: &str) -> Result<String, ProcError> {
        let path = self.root.join(pid.to_string()).join(file);
        fs::read(&path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProcError::NotFound(pid),
                // ESRCH surfaces when the process exits between open and read.
                _ if e.raw_os_error() == Some(libc::ESRCH) => ProcError::NotFound(pid),
                _ => ProcError::Io { pid, source: e },
            })
    }
}

/// Builders for fake procfs trees.
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    use std::fs;
    use std::path::Path;

    /// A `/proc/<pid>/stat` line with the given values and zeros elsewhere.
    pub fn stat_line(pid: u32, comm: &str, utime: u64, stime: u64, num_threads: u64, vsize: u64, rss_pages: u64) -> String {
        let mut fields = vec!["0".to_string(); 50];
        fields[0] = "S".into();
        fields[11] = utime.to_string();
        fields[12] = stime.to_string();
        fields[17] = num_threads.to_string();
        fields[20] = vsize.to_string();
        fields[21] = rss_pages.to_string();
        format!("{} ({}) {}\n", pid, comm, fields.join(" "))
    }

    /// Creates `<root>/<pid>` with a `stat` file, a `cmdline` and one task
    /// directory per tid.
    pub fn write_process(root: &Path, pid: u32, cmdline: &str, tids: &[u32], stat: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(dir.join("task")).unwrap();
        for tid in tids {
            fs::create_dir_all(dir.join("task").join(tid.to_string())).unwrap();
        }
        fs::write(dir.join("stat"), stat).unwrap();
        fs::write(dir.join("cmdline"), cmdline.replace(' ', "\0")).unwrap();
        fs::write(dir.join("comm"), "fake\n").unwrap();
    }

    pub fn remove_task(root: &Path, pid: u32, tid: u32) {
        fs::remove_dir_all(root.join(pid.to_string()).join("task").join(tid.to_string())).unwrap();
    }

    pub fn add_task(root: &Path, pid: u32, tid: u32) {
        fs::create_dir_all(root.join(pid.to_string()).join("task").join(tid.to_string())).unwrap();
    }
}

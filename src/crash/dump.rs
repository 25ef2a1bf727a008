//! Dump files.
//!
//! A dump written by [`ProcDumpWriter`] starts with one line of JSON
//! ([`DumpHeader`]): the fault, the process's threads, and its
//! `/proc/self/status` and `/proc/self/maps`. A full dump then has the
//! contents of every private writable mapping, as a sequence of
//!
//! ```plaintext
//! +----------------+----------------+---------------------+
//! | address: u64le | length: u64le  | length bytes        |
//! +----------------+----------------+---------------------+
//! ```
//!
//! segments. Anything that can't be read is left out, so are all-zero
//! chunks (untouched reservations would otherwise blow the dump up).

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::Path,
};

use serde::Serialize;
use thiserror::Error;

use super::context::FaultContext;
use crate::{
    os::{mem::read_own_memory, thread::thread_ids},
    profiler::ProfileSnapshot,
};

pub const DUMP_FORMAT: &str = "debugheap-dump";
pub const DUMP_VERSION: u32 = 1;

/// Memory is copied in chunks of this size, an unreadable chunk is skipped
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpKind {
    /// Threads, memory map and process status, no memory contents
    Filtered,
    /// Filtered, plus the contents of writable memory
    Full,
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("could not write dump: {0}")]
    Io(#[from] io::Error),
    #[error("could not serialize dump header: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything a dump writer gets to know about the crash
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpRequest<'a> {
    pub fault: Option<&'a FaultContext>,
    /// Thread that faulted (or asked for the dump)
    pub thread_id: u64,
    pub profile: ProfileSnapshot,
}

pub trait DumpWriter: Send + Sync {
    fn write_dump(&self, path: &Path, kind: DumpKind, request: &DumpRequest<'_>) -> Result<(), DumpError>;
}

#[derive(Debug, Serialize)]
pub struct DumpHeader<'a> {
    pub format: &'static str,
    pub version: u32,
    pub kind: DumpKind,
    pub pid: u32,
    pub fault: Option<&'a FaultContext>,
    pub thread_id: u64,
    pub profile: ProfileSnapshot,
    pub threads: Vec<u64>,
    pub status: String,
    pub maps: String,
}

/// One line of `/proc/<pid>/maps`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub private: bool,
    pub path: String,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

pub fn parse_maps(maps: &str) -> Vec<Mapping> {
    maps.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    // offset, device, inode
    let path = fields.nth(3).unwrap_or_default().to_owned();
    Some(Mapping {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        private: perms[3] == b'p',
        path,
    })
}

/// Writes dumps from what procfs and `process_vm_readv` can see of this
/// process
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcDumpWriter;

impl ProcDumpWriter {
    fn write_memory(out: &mut impl Write, mappings: &[Mapping]) -> io::Result<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        for mapping in mappings
            .iter()
            .filter(|m| m.readable && m.writable && m.private)
        {
            let mut address = mapping.start;
            while address < mapping.end {
                let len = CHUNK_SIZE.min(mapping.end - address);
                if let Ok(read) = read_own_memory(address, &mut chunk[..len]) {
                    if read > 0 && chunk[..read].iter().any(|&b| b != 0) {
                        out.write_all(&(address as u64).to_le_bytes())?;
                        out.write_all(&(read as u64).to_le_bytes())?;
                        out.write_all(&chunk[..read])?;
                    }
                }
                address += len;
            }
        }
        Ok(())
    }
}

impl DumpWriter for ProcDumpWriter {
    fn write_dump(&self, path: &Path, kind: DumpKind, request: &DumpRequest<'_>) -> Result<(), DumpError> {
        let maps = fs::read_to_string("/proc/self/maps").unwrap_or_default();
        let header = DumpHeader {
            format: DUMP_FORMAT,
            version: DUMP_VERSION,
            kind,
            pid: std::process::id(),
            fault: request.fault,
            thread_id: request.thread_id,
            profile: request.profile,
            threads: thread_ids(),
            status: fs::read_to_string("/proc/self/status").unwrap_or_default(),
            maps,
        };

        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut out, &header)?;
        out.write_all(b"\n")?;
        if kind == DumpKind::Full {
            Self::write_memory(&mut out, &parse_maps(&header.maps))?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read};

    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a21000 r--p 00000000 fd:01 1234                       /usr/bin/app
55d0c0c21000-55d0c0c42000 rw-p 00000000 00:00 0                          [heap]
7ffd1a2b3000-7ffd1a2d4000 rw-s 00000000 00:05 99                         /dev/shm/x
7ffd1a2d4000-7ffd1a2d6000 r-xp 00000000 00:00 0
garbage";

    #[test]
    fn maps_parse() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 4);
        assert_eq!(maps[0].path, "/usr/bin/app");
        assert!(maps[0].readable && !maps[0].writable && maps[0].private);
        assert_eq!(maps[1].start, 0x55d0c0c21000);
        assert_eq!(maps[1].len(), 0x21000);
        assert_eq!(maps[1].path, "[heap]");
        assert!(maps[1].writable && maps[1].private);
        assert!(!maps[2].private);
        assert_eq!(maps[3].path, "");
    }

    fn scratch_file(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("debugheap-dump-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn filtered_dump_is_just_a_header() {
        let path = scratch_file("filtered.dmp");
        let fault = FaultContext {
            signal: libc::SIGSEGV,
            code: 1,
            address: 0x10,
            instruction_pointer: 0x1234,
            stack_pointer: 0,
            frame_pointer: 0,
            thread_id: 7,
        };
        let request = DumpRequest {
            fault: Some(&fault),
            thread_id: 7,
            profile: ProfileSnapshot::EMPTY,
        };
        ProcDumpWriter.write_dump(&path, DumpKind::Filtered, &request).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        let header: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(header["format"], DUMP_FORMAT);
        assert_eq!(header["kind"], "filtered");
        assert_eq!(header["fault"]["address"], 0x10);
        assert_eq!(header["thread_id"], 7);
        assert!(!header["threads"].as_array().unwrap().is_empty());
        assert!(header["maps"].as_str().unwrap().contains("[stack]"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn full_dump_contains_our_memory() {
        let path = scratch_file("full.dmp");
        let marker = Box::new(*b"debugheap full dump marker");
        std::hint::black_box(&marker);
        ProcDumpWriter
            .write_dump(&path, DumpKind::Full, &DumpRequest::default())
            .unwrap();

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut header = String::new();
        reader.read_line(&mut header).unwrap();
        let header: serde_json::Value = serde_json::from_str(&header).unwrap();
        assert_eq!(header["kind"], "full");
        assert!(header["fault"].is_null());

        let mut memory = Vec::new();
        reader.read_to_end(&mut memory).unwrap();
        let found = memory.windows(marker.len()).any(|w| w == &marker[..]);
        assert!(found);
        fs::remove_file(path).unwrap();
    }
}

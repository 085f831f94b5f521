//! End-to-end dispatch tests against a temporary backing tree.
//!
//! Requests are hand-framed exactly as they arrive off a virtio-fs queue
//! and pushed through `MirrorFs::dispatch`; async completions are
//! collected from a capturing HAL stub.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use zerocopy::{FromBytes, IntoBytes};

use mirrorfs::config::LocalMirror;
use mirrorfs::hal::{Completion, CompletionStatus, Dispatch, RequestCtx};
use mirrorfs::ll::fuse_abi::{self as abi, consts, fuse_opcode};
use mirrorfs::server::MirrorFs;

const IN_HEADER_LEN: usize = size_of::<abi::fuse_in_header>();
const OUT_HEADER_LEN: usize = size_of::<abi::fuse_out_header>();

/// One framed request in an 8-byte aligned buffer.
struct Frame {
    storage: Vec<u64>,
    len: usize,
}

impl Frame {
    fn new(opcode: fuse_opcode, unique: u64, nodeid: u64, parts: &[&[u8]]) -> Self {
        let body_len: usize = parts.iter().map(|p| p.len()).sum();
        let total = IN_HEADER_LEN + body_len;
        let mut storage = vec![0u64; total.div_ceil(8)];
        let bytes = storage.as_mut_slice().as_mut_bytes();
        let header = abi::fuse_in_header {
            len: total as u32,
            opcode: opcode as u32,
            unique,
            nodeid,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        bytes[..IN_HEADER_LEN].copy_from_slice(header.as_bytes());
        let mut off = IN_HEADER_LEN;
        for part in parts {
            bytes[off..off + part.len()].copy_from_slice(part);
            off += part.len();
        }
        Self {
            storage,
            len: total,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.storage.as_slice().as_bytes()[..self.len]
    }
}

fn name_arg(name: &str) -> Vec<u8> {
    let mut v = name.as_bytes().to_vec();
    v.push(0);
    v
}

/// HAL stub capturing async completions.
struct TestHal {
    tx: Mutex<Sender<(RequestCtx, Vec<u8>, CompletionStatus)>>,
}

impl Completion for TestHal {
    fn complete(&self, ctx: RequestCtx, reply: mirrorfs::ll::ReplyBuf, status: CompletionStatus) {
        self.tx
            .lock()
            .unwrap()
            .send((ctx, reply.bytes().to_vec(), status))
            .unwrap();
    }
}

struct Harness {
    server: Arc<MirrorFs>,
    completions: Mutex<Receiver<(RequestCtx, Vec<u8>, CompletionStatus)>>,
    unique: AtomicU64,
    _tmp: Option<TempDir>,
}

impl Harness {
    fn new(metadata_timeout: f64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut harness = Self::for_dir(tmp.path().to_path_buf(), metadata_timeout);
        harness._tmp = Some(tmp);
        harness
    }

    fn for_dir(dir: PathBuf, metadata_timeout: f64) -> Self {
        let config = LocalMirror {
            dir,
            metadata_timeout,
            uring_cq_polling: false,
            uring_cq_polling_nthreads: 1,
            poll_nthreads: 1,
        };
        let (tx, rx) = channel();
        let hal = Arc::new(TestHal { tx: Mutex::new(tx) });
        let server = MirrorFs::new(&config, hal).unwrap();
        server.register_device(0);
        let harness = Self {
            server,
            completions: Mutex::new(rx),
            unique: AtomicU64::new(1),
            _tmp: None,
        };
        harness.init();
        harness
    }

    fn next_unique(&self) -> u64 {
        self.unique.fetch_add(1, Ordering::Relaxed)
    }

    fn init(&self) {
        let arg = abi::fuse_init_in {
            major: 7,
            minor: 31,
            max_readahead: 65536,
            flags: u32::MAX,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_INIT,
            self.next_unique(),
            0,
            &[arg.as_bytes()],
        );
        let reply = self.sync(&frame);
        assert_eq!(header(&reply).error, 0);
    }

    fn dispatch(&self, frame: &Frame) -> Dispatch {
        let unique = u64::from_le_bytes(frame.bytes()[8..16].try_into().unwrap());
        self.server.dispatch(0, frame.bytes(), RequestCtx(unique))
    }

    /// Dispatches a request that must complete synchronously.
    fn sync(&self, frame: &Frame) -> Vec<u8> {
        match self.dispatch(frame) {
            Dispatch::Sync(reply) => reply.bytes().to_vec(),
            other => panic!("expected synchronous completion, got {other:?}"),
        }
    }

    /// Dispatches a request that must go async and waits for its
    /// completion.
    fn pending(&self, frame: &Frame) -> (Vec<u8>, CompletionStatus) {
        let unique = u64::from_le_bytes(frame.bytes()[8..16].try_into().unwrap());
        match self.dispatch(frame) {
            Dispatch::Pending => {}
            other => panic!("expected pending completion, got {other:?}"),
        }
        let (ctx, reply, status) = self
            .completions
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10))
            .expect("async completion did not arrive");
        assert_eq!(ctx, RequestCtx(unique));
        (reply, status)
    }

    fn lookup(&self, parent: u64, name: &str) -> (i32, abi::fuse_entry_out) {
        let frame = Frame::new(
            fuse_opcode::FUSE_LOOKUP,
            self.next_unique(),
            parent,
            &[&name_arg(name)],
        );
        let reply = self.sync(&frame);
        let hdr = header(&reply);
        if hdr.error != 0 {
            return (hdr.error, abi::fuse_entry_out::default());
        }
        (0, entry(&reply))
    }

    fn forget(&self, nodeid: u64, nlookup: u64) {
        let arg = abi::fuse_forget_in { nlookup };
        let frame = Frame::new(
            fuse_opcode::FUSE_FORGET,
            self.next_unique(),
            nodeid,
            &[arg.as_bytes()],
        );
        match self.dispatch(&frame) {
            Dispatch::NoReply => {}
            other => panic!("forget must not reply, got {other:?}"),
        }
    }

    fn open(&self, nodeid: u64, flags: i32) -> u64 {
        let arg = abi::fuse_open_in { flags, unused: 0 };
        let frame = Frame::new(
            fuse_opcode::FUSE_OPEN,
            self.next_unique(),
            nodeid,
            &[arg.as_bytes()],
        );
        let reply = self.sync(&frame);
        assert_eq!(header(&reply).error, 0);
        let (out, _) = abi::fuse_open_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
        out.fh
    }

    fn release(&self, nodeid: u64, fh: u64) {
        let arg = abi::fuse_release_in {
            fh,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_RELEASE,
            self.next_unique(),
            nodeid,
            &[arg.as_bytes()],
        );
        let reply = self.sync(&frame);
        assert_eq!(header(&reply).error, 0);
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> (Vec<u8>, CompletionStatus) {
        let arg = abi::fuse_write_in {
            fh,
            offset,
            size: data.len() as u32,
            write_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_WRITE,
            self.next_unique(),
            1,
            &[arg.as_bytes(), data],
        );
        self.pending(&frame)
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> (Vec<u8>, CompletionStatus) {
        let arg = abi::fuse_read_in {
            fh,
            offset,
            size,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_READ,
            self.next_unique(),
            1,
            &[arg.as_bytes()],
        );
        self.pending(&frame)
    }

    fn opendir(&self, nodeid: u64) -> u64 {
        let arg = abi::fuse_open_in {
            flags: 0,
            unused: 0,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_OPENDIR,
            self.next_unique(),
            nodeid,
            &[arg.as_bytes()],
        );
        let reply = self.sync(&frame);
        assert_eq!(header(&reply).error, 0);
        let (out, _) = abi::fuse_open_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
        out.fh
    }

    fn readdirplus(&self, nodeid: u64, fh: u64, offset: u64, size: u32) -> Vec<u8> {
        let arg = abi::fuse_read_in {
            fh,
            offset,
            size,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let frame = Frame::new(
            fuse_opcode::FUSE_READDIRPLUS,
            self.next_unique(),
            nodeid,
            &[arg.as_bytes()],
        );
        let reply = self.sync(&frame);
        assert_eq!(header(&reply).error, 0);
        reply[OUT_HEADER_LEN..].to_vec()
    }

    fn path(&self) -> &Path {
        self._tmp.as_ref().unwrap().path()
    }
}

fn header(reply: &[u8]) -> abi::fuse_out_header {
    abi::fuse_out_header::read_from_prefix(reply).unwrap().0
}

fn entry(reply: &[u8]) -> abi::fuse_entry_out {
    abi::fuse_entry_out::read_from_prefix(&reply[OUT_HEADER_LEN..])
        .unwrap()
        .0
}

/// Parses a readdirplus payload into (entry, name) pairs.
fn parse_plus_entries(mut data: &[u8]) -> Vec<(abi::fuse_direntplus, String)> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (head, rest) = abi::fuse_direntplus::read_from_prefix(data).unwrap();
        let namelen = head.dirent.namelen as usize;
        let name = String::from_utf8(rest[..namelen].to_vec()).unwrap();
        let consumed = (size_of::<abi::fuse_direntplus>() + namelen).next_multiple_of(8);
        data = &data[consumed..];
        out.push((head, name));
    }
    out
}

#[test]
fn lookup_is_idempotent_and_forget_erases() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("hello"), b"content").unwrap();

    let (err, first) = h.lookup(1, "hello");
    assert_eq!(err, 0);
    assert!(first.nodeid > 1);
    let (err, second) = h.lookup(1, "hello");
    assert_eq!(err, 0);
    assert_eq!(first.nodeid, second.nodeid);
    assert_eq!(first.generation, second.generation);
    assert_eq!(first.attr.ino, second.attr.ino);
    assert_eq!(h.server.live_inodes(), 2);

    h.forget(first.nodeid, 1);
    assert_eq!(h.server.live_inodes(), 2);
    h.forget(first.nodeid, 1);
    assert_eq!(h.server.live_inodes(), 1);

    // a fresh lookup allocates a new, never-reused handle
    let (err, third) = h.lookup(1, "hello");
    assert_eq!(err, 0);
    assert!(third.nodeid > first.nodeid);
}

#[test]
fn negative_lookup_carries_entry_timeout() {
    let h = Harness::new(2.0);
    let frame = Frame::new(
        fuse_opcode::FUSE_LOOKUP,
        h.next_unique(),
        1,
        &[&name_arg("missing")],
    );
    let reply = h.sync(&frame);
    let hdr = header(&reply);
    assert_eq!(hdr.error, 0);
    let out = entry(&reply);
    assert_eq!(out.nodeid, 0);
    assert_eq!(out.entry_valid, 2);
    assert_eq!(h.server.live_inodes(), 1);
}

#[test]
fn write_then_read_round_trips_through_the_ring() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("data"), b"").unwrap();
    let (err, entry) = h.lookup(1, "data");
    assert_eq!(err, 0);
    let fh = h.open(entry.nodeid, libc::O_RDWR);

    let (reply, status) = h.write(fh, 0, b"ABCDEFGH");
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(header(&reply).error, 0);
    let (out, _) = abi::fuse_write_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
    assert_eq!(out.size, 8);

    let (reply, status) = h.read(fh, 0, 8);
    assert_eq!(status, CompletionStatus::Success);
    let hdr = header(&reply);
    assert_eq!(hdr.error, 0);
    assert_eq!(hdr.len as usize, OUT_HEADER_LEN + 8);
    assert_eq!(&reply[OUT_HEADER_LEN..], b"ABCDEFGH");

    h.release(entry.nodeid, fh);
    h.forget(entry.nodeid, 1);
    h.server.shutdown();
}

#[test]
fn short_read_at_eof_reports_actual_length() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("small"), b"xyz").unwrap();
    let (_, entry) = h.lookup(1, "small");
    let fh = h.open(entry.nodeid, libc::O_RDONLY);
    let (reply, status) = h.read(fh, 0, 4096);
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(header(&reply).len as usize, OUT_HEADER_LEN + 3);
    assert_eq!(&reply[OUT_HEADER_LEN..], b"xyz");
}

#[test]
fn read_on_bad_fd_completes_with_error_and_bare_header() {
    let h = Harness::new(1.0);
    let (reply, status) = h.read(999_999, 0, 16);
    assert_eq!(status, CompletionStatus::Error);
    let hdr = header(&reply);
    assert_eq!(hdr.error, -libc::EBADF);
    assert_eq!(hdr.len as usize, OUT_HEADER_LEN);
}

#[test]
fn unlink_with_open_handle_and_zero_timeout() {
    let h = Harness::new(0.0);
    std::fs::write(h.path().join("x"), b"still here").unwrap();
    let (err, entry) = h.lookup(1, "x");
    assert_eq!(err, 0);
    let fh = h.open(entry.nodeid, libc::O_RDONLY);

    let frame = Frame::new(
        fuse_opcode::FUSE_UNLINK,
        h.next_unique(),
        1,
        &[&name_arg("x")],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);

    // the name is gone
    let (err, negative) = h.lookup(1, "x");
    assert_eq!(err, 0);
    assert_eq!(negative.nodeid, 0);

    // the held handle still reads
    let (reply, status) = h.read(fh, 0, 10);
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(&reply[OUT_HEADER_LEN..], b"still here");

    h.release(entry.nodeid, fh);
    h.forget(entry.nodeid, 1);
    assert_eq!(h.server.live_inodes(), 1);
    h.server.shutdown();
}

#[test]
fn unlink_without_open_handles_invalidates_the_descriptor() {
    let h = Harness::new(0.0);
    std::fs::write(h.path().join("y"), b"doomed").unwrap();
    let (err, entry) = h.lookup(1, "y");
    assert_eq!(err, 0);

    let frame = Frame::new(
        fuse_opcode::FUSE_UNLINK,
        h.next_unique(),
        1,
        &[&name_arg("y")],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);

    // the record is retained for our lookup reference, but its backing
    // descriptor is gone
    assert_eq!(h.server.live_inodes(), 2);
    let arg = abi::fuse_getattr_in {
        getattr_flags: 0,
        dummy: 0,
        fh: 0,
    };
    let frame = Frame::new(
        fuse_opcode::FUSE_GETATTR,
        h.next_unique(),
        entry.nodeid,
        &[arg.as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, -libc::EBADF);

    h.forget(entry.nodeid, 1);
    assert_eq!(h.server.live_inodes(), 1);
}

#[test]
fn mountpoint_crossing_is_refused() {
    let root_dev = std::fs::metadata("/").unwrap();
    let proc_dev = match std::fs::metadata("/proc") {
        Ok(m) => m,
        Err(_) => return,
    };
    use std::os::unix::fs::MetadataExt;
    if root_dev.dev() == proc_dev.dev() {
        // no mountpoint to cross in this environment
        return;
    }
    let h = Harness::for_dir(PathBuf::from("/"), 1.0);
    let (err, _) = h.lookup(1, "proc");
    assert_eq!(err, -libc::EOPNOTSUPP);
}

#[test]
fn readdirplus_chunks_without_duplicates_and_balances_lookups() {
    let h = Harness::new(1.0);
    for i in 0..30 {
        std::fs::write(h.path().join(format!("f{i:02}")), b"x").unwrap();
    }
    let dir_fh = h.opendir(1);

    // each 3-character entry occupies 160 bytes, so 1600 fits exactly 10
    let per_call = 1600;
    let mut seen: Vec<(u64, String)> = Vec::new();
    let mut offset = 0;
    let first_len = {
        let data = h.readdirplus(1, dir_fh, offset, per_call);
        let entries = parse_plus_entries(&data);
        assert_eq!(entries.len(), 10);
        offset = entries.last().unwrap().0.dirent.off;
        seen.extend(
            entries
                .iter()
                .map(|(e, n)| (e.entry_out.nodeid, n.clone())),
        );
        entries.len()
    };
    loop {
        let data = h.readdirplus(1, dir_fh, offset, per_call);
        let entries = parse_plus_entries(&data);
        if entries.is_empty() {
            break;
        }
        offset = entries.last().unwrap().0.dirent.off;
        seen.extend(
            entries
                .iter()
                .map(|(e, n)| (e.entry_out.nodeid, n.clone())),
        );
    }
    assert_eq!(first_len, 10);
    assert_eq!(seen.len(), 30);
    let mut names: Vec<_> = seen.iter().map(|(_, n)| n.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 30, "duplicate entries across chunks");

    // one forget per returned entry drains the table back to the root:
    // the buffer-full entry's extra lookup was already compensated
    for (nodeid, _) in &seen {
        h.forget(*nodeid, 1);
    }
    let frame = Frame::new(
        fuse_opcode::FUSE_RELEASEDIR,
        h.next_unique(),
        1,
        &[abi::fuse_release_in {
            fh: dir_fh,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        }
        .as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);
    assert_eq!(h.server.live_inodes(), 1);
}

#[test]
fn mkdir_symlink_and_readlink_round_trip() {
    let h = Harness::new(1.0);

    let arg = abi::fuse_mkdir_in {
        mode: 0o755,
        umask: 0,
    };
    let frame = Frame::new(
        fuse_opcode::FUSE_MKDIR,
        h.next_unique(),
        1,
        &[arg.as_bytes(), &name_arg("sub")],
    );
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    let dir_entry = entry(&reply);
    assert_eq!(dir_entry.attr.mode & libc::S_IFMT, libc::S_IFDIR);

    let frame = Frame::new(
        fuse_opcode::FUSE_SYMLINK,
        h.next_unique(),
        dir_entry.nodeid,
        &[&name_arg("link"), &name_arg("../target")],
    );
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    let link_entry = entry(&reply);
    assert_eq!(link_entry.attr.mode & libc::S_IFMT, libc::S_IFLNK);

    let frame = Frame::new(
        fuse_opcode::FUSE_READLINK,
        h.next_unique(),
        link_entry.nodeid,
        &[],
    );
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    assert_eq!(&reply[OUT_HEADER_LEN..], b"../target");
}

#[test]
fn setattr_through_the_path_descriptor() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("perms"), b"x").unwrap();
    let (_, entry_out) = h.lookup(1, "perms");

    let mut arg = unsafe { std::mem::zeroed::<abi::fuse_setattr_in>() };
    arg.valid = consts::FATTR_MODE;
    arg.mode = 0o600;
    let frame = Frame::new(
        fuse_opcode::FUSE_SETATTR,
        h.next_unique(),
        entry_out.nodeid,
        &[arg.as_bytes()],
    );
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    let (out, _) = abi::fuse_attr_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
    assert_eq!(out.attr.mode & 0o7777, 0o600);

    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(h.path().join("perms")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
}

#[test]
fn create_registers_inode_and_open_count() {
    let h = Harness::new(1.0);
    let arg = abi::fuse_create_in {
        flags: libc::O_RDWR,
        mode: 0o644,
        umask: 0,
        padding: 0,
    };
    let frame = Frame::new(
        fuse_opcode::FUSE_CREATE,
        h.next_unique(),
        1,
        &[arg.as_bytes(), &name_arg("fresh")],
    );
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    let (created, rest) = abi::fuse_entry_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
    let (open_out, _) = abi::fuse_open_out::read_from_prefix(rest).unwrap();
    assert!(created.nodeid > 1);
    assert!(h.path().join("fresh").exists());

    let (reply, status) = h.write(open_out.fh, 0, b"hi");
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(header(&reply).error, 0);

    h.release(created.nodeid, open_out.fh);
    h.forget(created.nodeid, 1);
    assert_eq!(h.server.live_inodes(), 1);
    h.server.shutdown();
}

#[test]
fn statfs_reports_the_backing_filesystem() {
    let h = Harness::new(1.0);
    let frame = Frame::new(fuse_opcode::FUSE_STATFS, h.next_unique(), 1, &[]);
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, 0);
    let (out, _) = abi::fuse_statfs_out::read_from_prefix(&reply[OUT_HEADER_LEN..]).unwrap();
    assert!(out.st.bsize > 0);
    assert!(out.st.namelen > 0);
}

#[test]
fn unknown_nodeid_is_a_protocol_error() {
    let h = Harness::new(1.0);
    let (err, _) = h.lookup(777, "anything");
    assert_eq!(err, -libc::EINVAL);
}

#[test]
fn unknown_opcode_is_rejected() {
    let h = Harness::new(1.0);
    let mut frame = Frame::new(fuse_opcode::FUSE_STATFS, h.next_unique(), 1, &[]);
    // corrupt the opcode past anything the protocol defines
    let bytes = frame.storage.as_mut_slice().as_mut_bytes();
    bytes[4..8].copy_from_slice(&0xeeee_u32.to_le_bytes());
    let reply = h.sync(&frame);
    assert_eq!(header(&reply).error, -libc::EIO);
}

#[test]
fn requests_before_init_are_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let config = LocalMirror {
        dir: tmp.path().to_path_buf(),
        metadata_timeout: 1.0,
        uring_cq_polling: false,
        uring_cq_polling_nthreads: 1,
        poll_nthreads: 1,
    };
    let (tx, _rx) = channel();
    let hal = Arc::new(TestHal { tx: Mutex::new(tx) });
    let server = MirrorFs::new(&config, hal).unwrap();
    server.register_device(0);

    let frame = Frame::new(fuse_opcode::FUSE_STATFS, 1, 1, &[]);
    match server.dispatch(0, frame.bytes(), RequestCtx(1)) {
        Dispatch::Sync(reply) => assert_eq!(reply.error_code(), -libc::EIO),
        other => panic!("unexpected dispatch outcome {other:?}"),
    }
}

#[test]
fn flock_through_lk_ops() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("locked"), b"x").unwrap();
    let (_, entry_out) = h.lookup(1, "locked");
    let fh = h.open(entry_out.nodeid, libc::O_RDWR);

    let arg = abi::fuse_lk_in {
        fh,
        owner: 1,
        lk: abi::fuse_file_lock {
            start: 0,
            end: 0,
            typ: libc::F_WRLCK,
            pid: 0,
        },
        lk_flags: consts::FUSE_LK_FLOCK,
        padding: 0,
    };
    let frame = Frame::new(
        fuse_opcode::FUSE_SETLK,
        h.next_unique(),
        entry_out.nodeid,
        &[arg.as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);

    // a second flock on the same open handle upgrades/confirms silently;
    // unlocking must succeed as well
    let mut unlock = arg;
    unlock.lk.typ = libc::F_UNLCK;
    let frame = Frame::new(
        fuse_opcode::FUSE_SETLK,
        h.next_unique(),
        entry_out.nodeid,
        &[unlock.as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);

    // without the flock flag, byte-range locking is not remoted
    let mut posix = arg;
    posix.lk_flags = 0;
    let frame = Frame::new(
        fuse_opcode::FUSE_SETLK,
        h.next_unique(),
        entry_out.nodeid,
        &[posix.as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, -libc::ENOSYS);

    // lock queries have no flock(2) counterpart, flag or no flag
    let frame = Frame::new(
        fuse_opcode::FUSE_GETLK,
        h.next_unique(),
        entry_out.nodeid,
        &[arg.as_bytes()],
    );
    assert_eq!(header(&h.sync(&frame)).error, -libc::ENOSYS);
}

#[test]
fn concurrent_lookup_and_forget_converge() {
    let h = Arc::new(Harness::new(0.0));
    std::fs::write(h.path().join("contended"), b"x").unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        workers.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let (err, entry) = h.lookup(1, "contended");
                assert_eq!(err, 0);
                h.forget(entry.nodeid, 1);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(h.server.live_inodes(), 1);
}

#[test]
fn rename_keeps_identity() {
    let h = Harness::new(1.0);
    std::fs::write(h.path().join("before"), b"x").unwrap();
    let (_, old_entry) = h.lookup(1, "before");

    let arg = abi::fuse_rename_in { newdir: 1 };
    let frame = Frame::new(
        fuse_opcode::FUSE_RENAME,
        h.next_unique(),
        1,
        &[arg.as_bytes(), &name_arg("before"), &name_arg("after")],
    );
    assert_eq!(header(&h.sync(&frame)).error, 0);

    let (err, new_entry) = h.lookup(1, "after");
    assert_eq!(err, 0);
    assert_eq!(new_entry.nodeid, old_entry.nodeid);
    assert_eq!(new_entry.generation, old_entry.generation);
    let (err, _) = h.lookup(1, "before");
    assert_eq!(err, 0, "negative entry expected");
}

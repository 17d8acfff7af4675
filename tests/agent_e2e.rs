#![cfg(unix)]

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rfio::frame::{read_header, read_payload, write_frame};
use rfio::protocol::{status, BLOCK_SIZE, MAX_PAYLOAD};
use rfio::{
    send_pages, AgentSummary, Compression, Connection, Fio, FioError, Location, Op, OpenFlags,
    PageRecordReader, PageRequest, StandardPage,
};
use tempfile::TempDir;

type AgentThread = JoinHandle<rfio::Result<AgentSummary>>;

fn spawn_agent() -> (Fio, AgentThread) {
    spawn_agent_at(Location::BackupHost)
}

fn spawn_agent_at(here: Location) -> (Fio, AgentThread) {
    let (client, server) = UnixStream::pair().unwrap();
    let server_reader = server.try_clone().unwrap();
    let agent = thread::spawn(move || rfio::communicate(server_reader, server));
    let conn = Connection::new(client.try_clone().unwrap(), client);
    (Fio::connected(here, conn), agent)
}

fn finish(fio: Fio, agent: AgentThread) -> AgentSummary {
    drop(fio);
    agent.join().unwrap().unwrap()
}

fn page(block: u32, lsn: u64, fill: u8) -> Vec<u8> {
    let mut p = vec![fill; BLOCK_SIZE];
    StandardPage::set_lsn(&mut p, lsn);
    StandardPage::stamp(&mut p, block);
    p
}

fn os_error(err: FioError) -> i32 {
    match err {
        FioError::Io(e) => e.raw_os_error().expect("os error"),
        other => panic!("expected an OS error, got {other:?}"),
    }
}

#[test]
fn remote_results_match_local() {
    let tmp = TempDir::new().unwrap();
    let (fio, agent) = spawn_agent();
    let local = Fio::new(Location::BackupHost);

    for (ctx, loc, name) in [(&local, Location::Local, "local"), (&fio, Location::DbHost, "remote")] {
        let dir = tmp.path().join(name);
        ctx.mkdir(dir.join("base/1"), 0o700, loc).unwrap();
        let mut f = ctx.fopen(dir.join("base/1/1259"), "w", loc).unwrap();
        write!(f, "relation data {}", 1259).unwrap();
        f.close().unwrap();
        ctx.symlink("base/1/1259", dir.join("link"), loc).unwrap();
        ctx.rename(dir.join("base/1/1259"), dir.join("base/1/1260"), loc).unwrap();
        ctx.chmod(dir.join("base/1/1260"), 0o640, loc).unwrap();
    }

    let l = tmp.path().join("local");
    let r = tmp.path().join("remote");
    let ls = local.stat(l.join("base/1/1260"), true, Location::Local).unwrap();
    let rs = fio.stat(r.join("base/1/1260"), true, Location::DbHost).unwrap();
    assert_eq!((ls.kind, ls.mode, ls.size), (rs.kind, rs.mode, rs.size));
    assert_eq!(rs.permissions(), 0o640);

    let rl = fio.stat(r.join("link"), false, Location::DbHost).unwrap();
    assert!(rl.is_symlink());
    // dangling after the rename
    let l_err = local.stat(l.join("link"), true, Location::Local).unwrap_err();
    let r_err = fio.stat(r.join("link"), true, Location::DbHost).unwrap_err();
    assert_eq!(os_error(l_err), os_error(r_err));

    assert_eq!(
        local.load(l.join("base/1/1260"), Location::Local).unwrap(),
        fio.load(r.join("base/1/1260"), Location::DbHost).unwrap()
    );

    let names = |ctx: &Fio, dir: &Path, loc| -> BTreeSet<String> {
        ctx.opendir(dir, loc)
            .unwrap()
            .map(|e| e.unwrap().name.to_string_lossy().into_owned())
            .collect()
    };
    assert_eq!(names(&local, &l, Location::Local), names(&fio, &r, Location::DbHost));

    let l_err = local.unlink(l.join("missing"), Location::Local).unwrap_err();
    let r_err = fio.unlink(r.join("missing"), Location::DbHost).unwrap_err();
    assert_eq!(os_error(l_err), libc::ENOENT);
    assert_eq!(os_error(r_err), libc::ENOENT);

    assert!(fio.exists(r.join("base"), Location::DbHost).unwrap());
    assert!(!fio.exists(r.join("nothing"), Location::DbHost).unwrap());

    fio.unlink(r.join("link"), Location::DbHost).unwrap();
    assert_eq!(finish(fio, agent).released, 0);
}

#[test]
fn file_calls_over_the_connection() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pg_wal/000000010000000000000003");
    let (fio, agent) = spawn_agent();
    fio.mkdir(path.parent().unwrap(), 0o700, Location::DbHost).unwrap();

    let mut f = fio
        .open(&path, OpenFlags::from_mode("w+").unwrap(), Location::DbHost)
        .unwrap();
    assert!(f.is_remote());
    f.write_all(b"0123456789abcdef").unwrap();
    assert_eq!(f.seek(SeekFrom::Current(0)).unwrap(), 16);
    assert_eq!(f.seek(SeekFrom::End(-6)).unwrap(), 10);
    let mut tail = String::new();
    f.read_to_string(&mut tail).unwrap();
    assert_eq!(tail, "abcdef");

    let mut buf = [0u8; 4];
    assert_eq!(f.pread(&mut buf, 2).unwrap(), 4);
    assert_eq!(&buf, b"2345");
    // pread must not move the cursor
    assert_eq!(f.seek(SeekFrom::Current(0)).unwrap(), 16);

    f.truncate(8).unwrap();
    assert_eq!(f.fstat().unwrap().size, 8);
    f.flush().unwrap();
    assert!(matches!(
        f.sync(),
        Err(FioError::Io(ref e)) if e.kind() == std::io::ErrorKind::Unsupported
    ));
    f.close().unwrap();

    assert!(seek_before_start_fails(&fio, &path));
    assert_eq!(finish(fio, agent).released, 0);
}

fn seek_before_start_fails(fio: &Fio, path: &Path) -> bool {
    let mut f = fio.open(path, OpenFlags::read_only(), Location::DbHost).unwrap();
    f.seek(SeekFrom::Current(-1)).is_err()
}

#[test]
fn responses_arrive_in_request_order() {
    let tmp = TempDir::new().unwrap();
    let (fio, agent) = spawn_agent();
    let mut files: Vec<_> = (0..8)
        .map(|i| {
            fio.open(tmp.path().join(format!("f{i}")), OpenFlags::create_truncate().with(OpenFlags::READ), Location::DbHost)
                .unwrap()
        })
        .collect();
    for (i, f) in files.iter_mut().enumerate() {
        f.write_all(format!("file number {i}").as_bytes()).unwrap();
    }
    for (i, f) in files.iter_mut().enumerate() {
        let mut s = String::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_string(&mut s).unwrap();
        assert_eq!(s, format!("file number {i}"));
    }
    drop(files);
    let summary = finish(fio, agent);
    assert_eq!(summary.released, 0);
    assert!(summary.requests >= 8 * 5);
}

#[test]
fn three_block_pread_then_close_empties_table() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("16384");
    let data: Vec<u8> = [page(0, 1, 1), page(1, 2, 2), page(2, 3, 3)].concat();
    std::fs::write(&path, &data).unwrap();

    let (fio, agent) = spawn_agent();
    let mut f = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    let mut block = vec![0u8; BLOCK_SIZE];
    assert_eq!(f.pread(&mut block, 2 * BLOCK_SIZE as u64).unwrap(), BLOCK_SIZE);
    assert_eq!(block, &data[2 * BLOCK_SIZE..]);
    f.close().unwrap();

    let summary = finish(fio, agent);
    assert_eq!(summary.released, 0);
    assert_eq!(summary.requests, 3);
}

#[test]
fn handle_limit_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared");
    std::fs::write(&path, b"x").unwrap();
    let (fio, agent) = spawn_agent();

    let mut open: Vec<_> = (0..rfio::protocol::FDMAX)
        .map(|_| fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap())
        .collect();
    let err = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap_err();
    assert!(matches!(err, FioError::OutOfHandles));
    assert!(matches!(
        fio.opendir(tmp.path(), Location::DbHost).unwrap_err(),
        FioError::OutOfHandles
    ));

    open.pop().unwrap().close().unwrap();
    let again = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    open.push(again);
    drop(open);
    assert_eq!(finish(fio, agent).released, 0);
}

#[test]
fn closing_connection_releases_open_handles() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("postgresql.conf");
    std::fs::write(&path, b"shared_buffers = 128MB\n").unwrap();

    let (mut client, server) = UnixStream::pair().unwrap();
    let server_reader = server.try_clone().unwrap();
    let agent = thread::spawn(move || rfio::communicate(server_reader, server));

    let mut open = 0o600u32.to_le_bytes().to_vec();
    open.extend_from_slice(path.as_os_str().as_bytes());
    for _ in 0..2 {
        write_frame(&mut client, Op::Open, 0, OpenFlags::READ, &open).unwrap();
        let h = read_header(&mut client).unwrap().unwrap();
        assert_eq!(h.op(), Op::Open);
        assert!(h.status() >= 0);
    }
    write_frame(&mut client, Op::Opendir, 0, 0, tmp.path().as_os_str().as_bytes()).unwrap();
    assert_eq!(read_header(&mut client).unwrap().unwrap().status(), 2);

    // a CLOSE for a handle never handed out
    write_frame(&mut client, Op::Close, 9, 0, &[]).unwrap();
    let h = read_header(&mut client).unwrap().unwrap();
    assert_eq!(h.status(), status::INVALID_HANDLE);
    // a READ aimed at the directory handle
    write_frame(&mut client, Op::Read, 2, 10, &[]).unwrap();
    let h = read_header(&mut client).unwrap().unwrap();
    assert_eq!(h.op(), Op::Send);
    assert_eq!(h.status(), status::INVALID_HANDLE);
    assert!(read_payload(&mut client, h.size()).unwrap().is_empty());

    drop(client);
    let summary = agent.join().unwrap().unwrap();
    assert_eq!(summary.released, 3);
    assert_eq!(summary.requests, 5);
}

#[test]
fn frame_cut_short_is_a_communication_error() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let server_reader = server.try_clone().unwrap();
    let agent = thread::spawn(move || rfio::communicate(server_reader, server));
    // header promises 100 payload bytes, only 10 follow
    let header = rfio::Header::new(Op::Write, 0, 100, 0).unwrap();
    client.write_all(&header.encode()).unwrap();
    client.write_all(&[0u8; 10]).unwrap();
    drop(client);
    assert!(matches!(agent.join().unwrap(), Err(FioError::Communication(_))));
}

#[test]
fn load_streams_large_files() {
    let tmp = TempDir::new().unwrap();
    let (fio, agent) = spawn_agent();
    for size in [0, 1, MAX_PAYLOAD, MAX_PAYLOAD + 1, 2 * MAX_PAYLOAD + 4096] {
        let path = tmp.path().join(format!("blob{size}"));
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(fio.load(&path, Location::DbHost).unwrap(), data, "size {size}");
    }
    let err = fio.load(tmp.path().join("none"), Location::DbHost).unwrap_err();
    assert_eq!(os_error(err), libc::ENOENT);
    // the connection is still in step
    assert!(fio.exists(tmp.path(), Location::DbHost).unwrap());
    finish(fio, agent);
}

#[test]
fn large_remote_read_and_write() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("big");
    let data: Vec<u8> = (0..3 * MAX_PAYLOAD / 2).map(|i| (i % 241) as u8).collect();
    let (fio, agent) = spawn_agent();

    let mut f = fio.open(&path, OpenFlags::create_truncate(), Location::DbHost).unwrap();
    f.write_all(&data).unwrap();
    f.close().unwrap();

    let mut f = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    let mut back = Vec::new();
    f.read_to_end(&mut back).unwrap();
    assert_eq!(back, data);
    let mut whole = vec![0u8; data.len() + 10];
    assert_eq!(f.pread(&mut whole, 0).unwrap(), data.len());
    drop(f);
    finish(fio, agent);
}

fn segment_with_zero_pages(dir: &Path) -> (std::path::PathBuf, usize, usize) {
    let zero = vec![0u8; BLOCK_SIZE];
    let pages = vec![
        page(0, 10, 1),
        zero.clone(),
        page(2, 20, 2),
        page(3, 30, 3),
        zero,
        page(5, 40, 4),
    ];
    let path = dir.join("16385");
    std::fs::write(&path, pages.concat()).unwrap();
    (path, pages.len(), 2)
}

#[test]
fn send_pages_skips_zero_blocks_remotely() {
    let tmp = TempDir::new().unwrap();
    let (path, n, zeros) = segment_with_zero_pages(tmp.path());
    let req = PageRequest::new(n as u32).with_compression(Compression::zlib(6));

    let (fio, agent) = spawn_agent();
    let mut remote = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    let mut remote_out = Vec::new();
    let stats = send_pages(&mut remote, &mut remote_out, &req).unwrap();
    assert_eq!(stats.blocks_examined as usize, n);
    assert_eq!(stats.blocks_sent as usize, n - zeros);
    assert_eq!(stats.blocks_skipped as usize, zeros);
    assert!(!stats.truncated);

    let mut local = fio.open(&path, OpenFlags::read_only(), Location::Local).unwrap();
    let mut local_out = Vec::new();
    assert_eq!(send_pages(&mut local, &mut local_out, &req).unwrap(), stats);
    assert_eq!(local_out, remote_out);

    let blocks: Vec<u32> = PageRecordReader::new(&remote_out[..], req.compression, req.block_size)
        .map(|r| r.unwrap().block)
        .collect();
    assert_eq!(blocks, vec![0, 2, 3, 5]);

    drop(remote);
    assert_eq!(finish(fio, agent).released, 0);
}

#[test]
fn send_pages_into_a_file_on_the_same_connection_is_refused() {
    let tmp = TempDir::new().unwrap();
    let (path, n, _) = segment_with_zero_pages(tmp.path());
    let dest = tmp.path().join("16385.pages");
    // a third host: both the segment and the destination are remote
    let (fio, agent) = spawn_agent_at(Location::RemoteHost);

    let (tx, rx) = mpsc::channel();
    let worker = {
        let fio = fio.clone();
        thread::spawn(move || {
            let mut input = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
            let mut out = fio
                .open(&dest, OpenFlags::create_truncate(), Location::BackupHost)
                .unwrap();
            let result = send_pages(&mut input, &mut out, &PageRequest::new(n as u32));
            let size = out.fstat().map(|st| st.size);
            tx.send((result, size)).unwrap();
        })
    };
    let (result, size) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("send_pages did not return");
    worker.join().unwrap();

    assert!(matches!(result, Err(FioError::Protocol(ref msg)) if msg.contains("busy")));
    // the stream was drained, so the connection is still in step
    assert_eq!(size.unwrap(), 0);
    assert_eq!(finish(fio, agent).released, 0);
}

#[test]
fn send_pages_reports_checksum_mismatch() {
    let tmp = TempDir::new().unwrap();
    let mut bad = page(1, 7, 9);
    bad[4000] ^= 0x55;
    let path = tmp.path().join("16386");
    std::fs::write(&path, [page(0, 7, 1), bad, page(2, 7, 3)].concat()).unwrap();

    let (fio, agent) = spawn_agent();
    let mut f = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    let mut out = Vec::new();
    let err = send_pages(&mut f, &mut out, &PageRequest::new(3).with_segment_block(0)).unwrap_err();
    assert!(matches!(err, FioError::PageChecksumMismatch { block: 1 }));
    // block 0 was already on its way
    assert_eq!(out.len(), 8 + BLOCK_SIZE);

    // the connection stays usable
    assert_eq!(f.fstat().unwrap().size, 3 * BLOCK_SIZE as u64);
    drop(f);
    finish(fio, agent);
}

#[test]
fn send_pages_stops_at_truncation() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("16387");
    std::fs::write(&path, [page(0, 5, 1), page(1, 5, 2)].concat()).unwrap();
    let (fio, agent) = spawn_agent();
    let mut f = fio.open(&path, OpenFlags::read_only(), Location::DbHost).unwrap();
    let stats = send_pages(&mut f, &mut std::io::sink(), &PageRequest::new(10)).unwrap();
    assert!(stats.truncated);
    assert_eq!((stats.blocks_examined, stats.blocks_sent, stats.blocks_skipped), (2, 2, 0));
    drop(f);
    finish(fio, agent);
}

#[test]
fn gzip_stream_through_agent() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000000010000000000000007.gz");
    let text: Vec<u8> = (0..5000).flat_map(|i| format!("xlog {i}\n").into_bytes()).collect();
    let (fio, agent) = spawn_agent();

    let mut gz = fio.gzopen(&path, "wb", 6, Location::BackupHost).unwrap();
    gz.write_all(&text).unwrap();
    gz.close().unwrap();

    let mut gz = fio.gzopen(&path, "wb", 6, Location::DbHost).unwrap();
    gz.write_all(&text).unwrap();
    gz.close().unwrap();

    let mut back = Vec::new();
    let mut gz = fio.gzopen(&path, "rb", 0, Location::Local).unwrap();
    gz.read_to_end(&mut back).unwrap();
    assert_eq!(back, text);

    let mut gz = fio.gzopen(&path, "rb", 0, Location::DbHost).unwrap();
    gz.seek(SeekFrom::Start(100)).unwrap();
    let mut chunk = [0u8; 10];
    gz.read_exact(&mut chunk).unwrap();
    assert_eq!(&chunk, &text[100..110]);
    gz.close().unwrap();
    assert_eq!(finish(fio, agent).released, 0);
}

#[test]
fn tcp_agent_serves_connections() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("PG_VERSION"), b"16\n").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || rfio::agent::serve(listener, Arc::new(StandardPage)));

    for _ in 0..2 {
        let fio = Fio::connected(Location::BackupHost, Connection::tcp(&addr).unwrap());
        let data = fio.load(tmp.path().join("PG_VERSION"), Location::RemoteHost).unwrap();
        assert_eq!(data, b"16\n");
    }
}

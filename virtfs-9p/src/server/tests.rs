use super::{Server, ServerError, Session};
use crate::codec::{
    marshal, unmarshal, Deserializer, LinuxStat, Qid, Serializer, SgList, Wire, WireStat,
};
use crate::config::ServerConfig;
use crate::protocol::{Opcode, NOFID};
use crate::reclaim::DescriptorBudget;
use crate::transport::stream_transport;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::{JoinHandle, LocalSet};
use virtfs_constants::error::Error;
use virtfs_constants::logger::NullLogger;
use virtfs_fs::backend::host::HostFs;

const MSIZE: u32 = 8192;
const ENOENT: u32 = 2;
const EINVAL: u32 = 22;
const EOPNOTSUPP: u32 = 95;

const O_RDONLY: u32 = 0;
const O_RDWR: u32 = 2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;

struct Client {
    rd: ReadHalf<DuplexStream>,
    wr: WriteHalf<DuplexStream>,
    tag: u16,
}

type Reply = (u8, u16, SgList, usize);

impl Client {
    async fn send<T: Wire>(&mut self, op: Opcode, body: &T) -> u16 {
        let mut sg = SgList::zeroed(MSIZE as usize, 512);
        let n = marshal(&mut sg, 7, MSIZE as usize, body).unwrap();
        self.tag = self.tag.wrapping_add(1);
        marshal(&mut sg, 0, 7, &((n + 7) as u32, op as u8, self.tag)).unwrap();
        self.wr.write_all(&sg.to_vec(n + 7)).await.unwrap();
        self.tag
    }

    async fn recv(&mut self) -> Reply {
        let mut size = [0u8; 4];
        self.rd.read_exact(&mut size).await.unwrap();
        let len = u32::from_le_bytes(size) as usize;
        let mut data = size.to_vec();
        data.resize(len, 0);
        self.rd.read_exact(&mut data[4..]).await.unwrap();
        let sg = SgList::from_bytes(&data, 512);
        let ((_, op, tag), _) = unmarshal::<(u32, u8, u16)>(&sg, 0, len).unwrap();
        (op, tag, sg, len)
    }

    /// Checks a reply's opcode, returning the error code it carries if it is an error.
    fn check(op: Opcode, reply: &Reply) -> Result<(), u32> {
        let (rop, _, sg, len) = reply;
        if *rop == Opcode::Rlerror as u8 {
            return Err(unmarshal::<u32>(sg, 7, *len).unwrap().0);
        }
        if *rop == Opcode::Rerror as u8 {
            let ((text, code), _) = unmarshal::<(Vec<u8>, u32)>(sg, 7, *len).unwrap();
            assert!(!text.is_empty());
            return Err(code);
        }
        assert_eq!(*rop, op as u8 + 1);
        Ok(())
    }

    async fn call(&mut self, op: Opcode, body: &impl Wire) -> Result<Reply, u32> {
        let tag = self.send(op, body).await;
        let reply = self.recv().await;
        assert_eq!(reply.1, tag);
        Self::check(op, &reply)?;
        Ok(reply)
    }

    /// Sends a request and decodes the whole reply body.
    async fn rpc<R: Wire>(&mut self, op: Opcode, body: &impl Wire) -> Result<R, u32> {
        let (_, _, sg, len) = self.call(op, body).await?;
        let (val, used) = unmarshal::<R>(&sg, 7, len).unwrap();
        assert_eq!(used + 7, len, "trailing bytes in reply to {:?}", op);
        Ok(val)
    }

    async fn version(&mut self, version: &str) -> (u32, Vec<u8>) {
        self.rpc(Opcode::Tversion, &(MSIZE, version.as_bytes().to_vec()))
            .await
            .unwrap()
    }

    async fn attach(&mut self, fid: u32) -> Result<Qid, u32> {
        self.rpc(
            Opcode::Tattach,
            &(fid, NOFID, b"user".to_vec(), Vec::new(), 1000u32),
        )
        .await
    }

    async fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Result<Vec<Qid>, u32> {
        let mut body = (fid, newfid, names.len() as u16).encode_vec();
        for n in names {
            body.extend(n.as_bytes().to_vec().encode_vec());
        }
        let (_, _, sg, len) = self.call(Opcode::Twalk, &Raw(body)).await?;
        let (n, _) = unmarshal::<u16>(&sg, 7, len).unwrap();
        let mut qids = Vec::new();
        for i in 0..n as usize {
            qids.push(unmarshal::<Qid>(&sg, 9 + i * Qid::SIZE, len).unwrap().0);
        }
        Ok(qids)
    }

    async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>, u32> {
        let (_, _, sg, len) = self.call(Opcode::Tread, &(fid, offset, count)).await?;
        let (n, _) = unmarshal::<u32>(&sg, 7, len).unwrap();
        assert_eq!(n as usize + 11, len);
        Ok(sg.to_vec(len)[11..].to_vec())
    }

    async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32, u32> {
        let mut body = (fid, offset, data.len() as u32).encode_vec();
        body.extend_from_slice(data);
        self.rpc(Opcode::Twrite, &Raw(body)).await
    }

    async fn clunk(&mut self, fid: u32) -> Result<(), u32> {
        self.rpc(Opcode::Tclunk, &fid).await
    }

    /// Reads one page of entries with `Treaddir`.
    async fn readdir(&mut self, fid: u32, offset: u64, count: u32) -> Vec<(Vec<u8>, u64)> {
        let (_, _, sg, len) = self
            .call(Opcode::Treaddir, &(fid, offset, count))
            .await
            .unwrap();
        let (total, _) = unmarshal::<u32>(&sg, 7, len).unwrap();
        assert!(total <= count);
        assert_eq!(total as usize + 11, len);
        let mut out = Vec::new();
        let mut pos = 11;
        while pos < len {
            let ((_, off, _, name), used) =
                unmarshal::<(Qid, u64, u8, Vec<u8>)>(&sg, pos, len).unwrap();
            out.push((name, off));
            pos += used;
        }
        out
    }

    /// Reads the rest of a directory from `offset`, `count` bytes at a time.
    async fn readdir_from(
        &mut self,
        fid: u32,
        mut offset: u64,
        count: u32,
    ) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        loop {
            let page = self.readdir(fid, offset, count).await;
            match page.last() {
                Some((_, off)) => offset = *off,
                None => return out,
            }
            out.extend(page);
        }
    }

    /// Reads a whole directory with `Treaddir`, `count` bytes at a time.
    async fn readdir_all(&mut self, fid: u32, count: u32) -> Vec<(Vec<u8>, u64)> {
        self.readdir_from(fid, 0, count).await
    }
}

/// Bytes already in wire form.
struct Raw(Vec<u8>);

impl Wire for Raw {
    fn decode(_d: &mut Deserializer<'_>) -> Result<Self, Error> {
        unreachable!()
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write_data(&self.0)
    }
}

trait EncodeVec {
    fn encode_vec(&self) -> Vec<u8>;
}

impl<T: Wire> EncodeVec for T {
    fn encode_vec(&self) -> Vec<u8> {
        let mut sg = SgList::zeroed(MSIZE as usize, MSIZE as usize);
        let n = marshal(&mut sg, 0, MSIZE as usize, self).unwrap();
        sg.to_vec(n)
    }
}

fn roomy_budget() -> Arc<DescriptorBudget> {
    Arc::new(DescriptorBudget::new(1 << 16, 128))
}

/// Starts a server on `root`.  Must be called inside a `LocalSet`.
fn start(
    root: &Path,
    budget: Arc<DescriptorBudget>,
) -> (Client, Rc<Session>, JoinHandle<Result<(), ServerError>>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let (srd, swr) = tokio::io::split(server);
    let config = ServerConfig::with_budget(root, budget).max_msize(MSIZE);
    let srv = Server::new(config, Arc::new(HostFs::new(root)), Arc::new(NullLogger));
    let session = srv.session().clone();
    let handle = tokio::task::spawn_local(async move {
        let (mut rx, mut tx) = stream_transport(srd, swr, MSIZE);
        srv.run(&mut rx, &mut tx).await
    });
    let (rd, wr) = tokio::io::split(client);
    (Client { rd, wr, tag: 0 }, session, handle)
}

async fn stop(client: Client, handle: JoinHandle<Result<(), ServerError>>) {
    drop(client);
    handle.await.unwrap().unwrap();
}

fn is_reclaimed(session: &Session, id: u32) -> bool {
    session.with_fids(|t| {
        t.values()
            .find(|f| f.id() == id)
            .map(|f| f.borrow().is_reclaimed())
            .unwrap()
    })
}

#[tokio::test]
async fn attach_walk_open_read_clunk() {
    let dir = tempfile::tempdir().unwrap();
    let contents: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("hello.txt"), &contents).unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            assert_eq!(c.version("9P2000.L").await, (MSIZE, b"9P2000.L".to_vec()));
            let root = c.attach(0).await.unwrap();
            assert_eq!(root.kind, 0x80);
            let qids = c.walk(0, 1, &["hello.txt"]).await.unwrap();
            assert_eq!(qids.len(), 1);
            assert_eq!(qids[0].kind, 0);
            let (qid, iounit): (Qid, u32) = c.rpc(Opcode::Tlopen, &(1u32, O_RDONLY)).await.unwrap();
            assert_eq!(qid, qids[0]);
            assert!(iounit > 0 && iounit <= MSIZE - 24);

            let mut got = Vec::new();
            loop {
                let chunk = c.read(1, got.len() as u64, 1 << 20).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                assert!(chunk.len() <= MSIZE as usize - 11);
                got.extend(chunk);
            }
            assert_eq!(got, contents);

            c.clunk(1).await.unwrap();
            assert_eq!(c.read(1, 0, 10).await, Err(ENOENT));
            assert_eq!(c.clunk(1).await, Err(ENOENT));
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn duplicate_fids_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(5).await.unwrap();
            assert_eq!(c.attach(5).await, Err(EINVAL));
            c.walk(5, 6, &["sub"]).await.unwrap();
            assert_eq!(c.walk(5, 6, &[]).await, Err(EINVAL));
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn partial_walks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
    std::fs::write(dir.path().join("a/file"), b"x").unwrap();
    std::os::unix::fs::symlink("b", dir.path().join("a/link")).unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();

            // Only the first step failing is an error.
            assert_eq!(c.walk(0, 1, &["missing"]).await, Err(ENOENT));
            let qids = c.walk(0, 1, &["a", "missing", "b"]).await.unwrap();
            assert_eq!(qids.len(), 1);
            assert_eq!(c.clunk(1).await, Err(ENOENT));

            // Symlinks are not followed.
            assert_eq!(c.walk(0, 1, &["a", "link", "x"]).await.unwrap().len(), 2);
            assert_eq!(c.walk(0, 1, &["a", "file", "x"]).await.unwrap().len(), 2);

            // Dot-dot stops at the root, and a full walk allocates the new fid.
            let qids = c.walk(0, 1, &["..", "a", "..", "a", "b"]).await.unwrap();
            assert_eq!(qids.len(), 5);
            assert_eq!(qids[0].kind, 0x80);
            c.clunk(1).await.unwrap();

            assert_eq!(c.walk(0, 1, &["a/b"]).await, Err(ENOENT));
            assert_eq!(c.walk(0, 1, &[""]).await, Err(ENOENT));
            let many = ["a"; 17];
            assert_eq!(c.walk(0, 1, &many).await, Err(EINVAL));

            // Walking a fid onto itself moves it.
            c.walk(0, 2, &[]).await.unwrap();
            c.walk(2, 2, &["a", "b"]).await.unwrap();
            let st: LinuxStat = c.rpc(Opcode::Tgetattr, &(2u32, 0x7ffu64)).await.unwrap();
            assert_eq!(st.mode & 0o170000, 0o040000);
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn exclusive_creates_are_never_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plain"), b"plain contents").unwrap();
    let budget = Arc::new(DescriptorBudget::new(1, 16));
    LocalSet::new()
        .run_until(async {
            let (mut c, session, handle) = start(dir.path(), budget.clone());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &[]).await.unwrap();
            let _: (Qid, u32) = c
                .rpc(
                    Opcode::Tlcreate,
                    &(1u32, b"new".to_vec(), O_RDWR | O_CREAT | O_EXCL, 0o644u32, 0u32),
                )
                .await
                .unwrap();
            c.walk(0, 2, &["plain"]).await.unwrap();
            let _: (Qid, u32) = c.rpc(Opcode::Tlopen, &(2u32, O_RDONLY)).await.unwrap();
            assert!(budget.under_pressure());

            session.reclaim().await;
            session.reclaim().await;
            assert!(!is_reclaimed(&session, 1));
            assert!(is_reclaimed(&session, 2));

            // The reclaimed fid comes back on its own.
            assert_eq!(c.read(2, 6, 100).await.unwrap(), b"contents");
            assert!(!is_reclaimed(&session, 2));
            assert_eq!(c.write(1, 0, b"fresh").await, Ok(5));
            assert_eq!(std::fs::read(dir.path().join("new")).unwrap(), b"fresh");

            c.clunk(1).await.unwrap();
            c.clunk(2).await.unwrap();
            assert_eq!(budget.open_descriptors(), 0);
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn short_xattr_create_fails_at_clunk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &["f"]).await.unwrap();
            c.rpc::<()>(
                Opcode::Txattrcreate,
                &(1u32, b"user.test".to_vec(), 10u64, 0u32),
            )
            .await
            .unwrap();
            assert_eq!(c.write(1, 0, b"abc").await, Ok(3));
            assert_eq!(c.write(1, 11, b"abc").await, Err(28));
            assert_eq!(c.clunk(1).await, Err(EINVAL));
            assert!(session.with_fids(|t| !t.contains(1)));

            c.walk(0, 2, &["f"]).await.unwrap();
            assert_eq!(
                c.rpc::<()>(
                    Opcode::Txattrcreate,
                    &(2u32, b"user.big".to_vec(), 65537u64, 0u32),
                )
                .await,
                Err(7)
            );
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn flush_does_not_cancel() {
    let dir = tempfile::tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            // A flush is answered at once and leaves the flushed request alone.
            let walk = c.send(Opcode::Twalk, &(0u32, 1u32, 0u16)).await;
            let flush = c.send(Opcode::Tflush, &walk).await;
            let mut tags = vec![c.recv().await, c.recv().await];
            tags.sort_by_key(|r| r.1);
            assert_eq!(tags[0].1, walk);
            assert_eq!(tags[0].0, Opcode::Rwalk as u8);
            assert_eq!(tags[1].1, flush);
            assert_eq!(tags[1].0, Opcode::Rflush as u8);
            c.clunk(1).await.unwrap();
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn renames_move_open_fids() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/f"), b"data").unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &["a", "f"]).await.unwrap();
            c.walk(0, 2, &["a"]).await.unwrap();
            c.rpc::<()>(
                Opcode::Trenameat,
                &(0u32, b"a".to_vec(), 0u32, b"b".to_vec()),
            )
            .await
            .unwrap();
            let _: (Qid, u32) = c.rpc(Opcode::Tlopen, &(1u32, O_RDONLY)).await.unwrap();
            assert_eq!(c.read(1, 0, 100).await.unwrap(), b"data");
            c.walk(2, 3, &["f"]).await.unwrap();

            // Trename moves a single fid's file, and renaming onto dot is refused.
            c.rpc::<()>(Opcode::Trename, &(3u32, 0u32, b"g".to_vec()))
                .await
                .unwrap();
            assert!(dir.path().join("g").exists());
            assert_eq!(
                c.rpc::<()>(Opcode::Trename, &(3u32, 0u32, b"..".to_vec()))
                    .await,
                Err(21)
            );
            let st: LinuxStat = c.rpc(Opcode::Tgetattr, &(3u32, 0x7ffu64)).await.unwrap();
            assert_eq!(st.size, 4);
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn linux_namespace_operations() {
    let dir = tempfile::tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            let d: Qid = c
                .rpc(Opcode::Tmkdir, &(0u32, b"d".to_vec(), 0o755u32, 0u32))
                .await
                .unwrap();
            assert_eq!(d.kind, 0x80);
            let l: Qid = c
                .rpc(
                    Opcode::Tsymlink,
                    &(0u32, b"l".to_vec(), b"d".to_vec(), 0u32),
                )
                .await
                .unwrap();
            assert_eq!(l.kind, 0x02);
            c.walk(0, 1, &["l"]).await.unwrap();
            let target: Vec<u8> = c.rpc(Opcode::Treadlink, &1u32).await.unwrap();
            assert_eq!(target, b"d");
            c.rpc::<Qid>(
                Opcode::Tmknod,
                &(0u32, b"p".to_vec(), 0o010644u32, 0u32, 0u32, 0u32),
            )
            .await
            .unwrap();

            c.walk(0, 2, &[]).await.unwrap();
            c.rpc::<(Qid, u32)>(
                Opcode::Tlcreate,
                &(2u32, b"f".to_vec(), O_RDWR, 0o600u32, 0u32),
            )
            .await
            .unwrap();
            assert_eq!(c.write(2, 0, b"hello world").await, Ok(11));
            c.rpc::<()>(Opcode::Tfsync, &(2u32, 0u32)).await.unwrap();
            c.rpc::<()>(Opcode::Tlink, &(0u32, 2u32, b"hard".to_vec()))
                .await
                .unwrap();
            assert_eq!(std::fs::read(dir.path().join("hard")).unwrap(), b"hello world");

            // Truncate through setattr, then look at the result.
            c.walk(0, 3, &["f"]).await.unwrap();
            c.rpc::<()>(
                Opcode::Tsetattr,
                &(3u32, 0x9u32, 0o640u32, 0u32, 0u32, 5u64, 0u64, 0u64, 0u64, 0u64),
            )
            .await
            .unwrap();
            let st: LinuxStat = c.rpc(Opcode::Tgetattr, &(3u32, 0x7ffu64)).await.unwrap();
            assert_eq!(st.size, 5);
            assert_eq!(st.mode & 0o7777, 0o640);
            assert_eq!(st.nlink, 2);

            let _: (u32, u32, u64, u64, u64, u64, u64, u64, u32) =
                c.rpc(Opcode::Tstatfs, &0u32).await.unwrap();

            assert_eq!(
                c.rpc::<()>(Opcode::Tunlinkat, &(0u32, b"d".to_vec(), 0u32))
                    .await
                    .is_err(),
                true
            );
            c.rpc::<()>(Opcode::Tunlinkat, &(0u32, b"d".to_vec(), 0x200u32))
                .await
                .unwrap();
            c.rpc::<()>(Opcode::Tunlinkat, &(0u32, b"hard".to_vec(), 0u32))
                .await
                .unwrap();
            assert!(!dir.path().join("d").exists());
            assert!(!dir.path().join("hard").exists());

            // Locks always succeed.
            let status: u8 = c
                .rpc(
                    Opcode::Tlock,
                    &(2u32, 1u8, 0u32, 0u64, 10u64, 42u32, b"client".to_vec()),
                )
                .await
                .unwrap();
            assert_eq!(status, 0);
            let lock: (u8, u64, u64, u32, Vec<u8>) = c
                .rpc(
                    Opcode::Tgetlock,
                    &(2u32, 1u8, 3u64, 10u64, 42u32, b"client".to_vec()),
                )
                .await
                .unwrap();
            assert_eq!(lock, (2, 3, 10, 42, b"client".to_vec()));
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn readdir_pages_resume() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..40 {
        std::fs::write(dir.path().join(format!("entry-{:02}", i)), b"").unwrap();
    }
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &[]).await.unwrap();
            let _: (Qid, u32) = c.rpc(Opcode::Tlopen, &(1u32, O_RDONLY)).await.unwrap();

            // Each entry is 32 bytes, so a 100 byte page holds three.
            let mut names: Vec<Vec<u8>> = c
                .readdir_all(1, 100)
                .await
                .into_iter()
                .map(|(n, _)| n)
                .collect();
            names.sort();
            let mut want: Vec<Vec<u8>> = (0..40)
                .map(|i| format!("entry-{:02}", i).into_bytes())
                .collect();
            want.push(b".".to_vec());
            want.push(b"..".to_vec());
            want.sort();
            assert_eq!(names, want);

            // Starting over gives the same listing.
            let again = c.readdir_all(1, 4000).await;
            assert_eq!(again.len(), 42);
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn reclaimed_directories_resume_listing() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..30 {
        std::fs::write(dir.path().join(format!("entry-{:02}", i)), b"").unwrap();
    }
    let budget = Arc::new(DescriptorBudget::new(1, 16));
    LocalSet::new()
        .run_until(async {
            let (mut c, session, handle) = start(dir.path(), budget.clone());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &[]).await.unwrap();
            let _: (Qid, u32) = c.rpc(Opcode::Tlopen, &(1u32, O_RDONLY)).await.unwrap();

            let first = c.readdir(1, 0, 100).await;
            assert_eq!(first.len(), 3);
            let resume = first[2].1;

            session.reclaim().await;
            session.reclaim().await;
            assert!(is_reclaimed(&session, 1));
            assert_eq!(budget.open_descriptors(), 0);

            let rest = c.readdir_from(1, resume, 100).await;
            assert!(!is_reclaimed(&session, 1));
            let mut names: Vec<Vec<u8>> =
                first.into_iter().chain(rest).map(|(n, _)| n).collect();
            names.sort();
            let mut want: Vec<Vec<u8>> = (0..30)
                .map(|i| format!("entry-{:02}", i).into_bytes())
                .collect();
            want.push(b".".to_vec());
            want.push(b"..".to_vec());
            want.sort();
            assert_eq!(names, want);

            c.clunk(1).await.unwrap();
            assert_eq!(budget.open_descriptors(), 0);
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn xattrs_read_back_through_walks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            c.walk(0, 1, &["f"]).await.unwrap();
            c.rpc::<()>(
                Opcode::Txattrcreate,
                &(1u32, b"user.test".to_vec(), 5u64, 0u32),
            )
            .await
            .unwrap();
            assert_eq!(c.write(1, 0, b"hello").await, Ok(5));
            // Not every file system supports user attributes.
            match c.clunk(1).await {
                Ok(()) => (),
                Err(EOPNOTSUPP) => return stop(c, handle).await,
                Err(e) => panic!("xattr commit failed with {}", e),
            }

            c.walk(0, 1, &["f"]).await.unwrap();
            let size: u64 = c
                .rpc(Opcode::Txattrwalk, &(1u32, 2u32, b"user.test".to_vec()))
                .await
                .unwrap();
            assert_eq!(size, 5);
            assert_eq!(c.read(2, 0, 100).await.unwrap(), b"hello");
            assert_eq!(c.read(2, 3, 100).await.unwrap(), b"lo");
            assert_eq!(c.read(2, 5, 100).await.unwrap(), b"");
            c.clunk(2).await.unwrap();

            let size: u64 = c
                .rpc(Opcode::Txattrwalk, &(1u32, 3u32, Vec::<u8>::new()))
                .await
                .unwrap();
            let list = c.read(3, 0, 4096).await.unwrap();
            assert_eq!(list.len() as u64, size);
            assert!(list.split(|b| *b == 0).any(|n| n == b"user.test"));
            c.clunk(3).await.unwrap();

            assert!(c
                .rpc::<u64>(Opcode::Txattrwalk, &(1u32, 4u32, b"user.none".to_vec()))
                .await
                .is_err());
            c.clunk(1).await.unwrap();
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn symlinked_directories_stay_outside_the_export() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret"), b"secret").unwrap();
    std::fs::write(dir.path().join("inside"), b"inside").unwrap();
    std::os::unix::fs::symlink(outside.path(), dir.path().join("l")).unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            let qids = c.walk(0, 1, &["l"]).await.unwrap();
            assert_eq!(qids.len(), 1);
            assert_eq!(qids[0].kind, 0x02);

            // Walking through the link stops at the link.
            assert_eq!(c.walk(0, 2, &["l", "secret"]).await.unwrap().len(), 1);
            assert_eq!(c.clunk(2).await, Err(ENOENT));

            assert!(c
                .rpc::<Qid>(Opcode::Tmkdir, &(1u32, b"evil".to_vec(), 0o755u32, 0u32))
                .await
                .is_err());
            assert!(c
                .rpc::<(Qid, u32)>(
                    Opcode::Tlcreate,
                    &(1u32, b"evil.txt".to_vec(), O_RDWR | O_CREAT, 0o644u32, 0u32),
                )
                .await
                .is_err());
            assert!(c
                .rpc::<Qid>(
                    Opcode::Tsymlink,
                    &(1u32, b"evil.lnk".to_vec(), b"/etc".to_vec(), 0u32),
                )
                .await
                .is_err());
            assert!(c
                .rpc::<Qid>(
                    Opcode::Tmknod,
                    &(1u32, b"evil.fifo".to_vec(), 0o010644u32, 0u32, 0u32, 0u32),
                )
                .await
                .is_err());
            assert!(c
                .rpc::<()>(
                    Opcode::Trenameat,
                    &(0u32, b"inside".to_vec(), 1u32, b"moved".to_vec()),
                )
                .await
                .is_err());
            assert!(c
                .rpc::<()>(Opcode::Tunlinkat, &(1u32, b"secret".to_vec(), 0u32))
                .await
                .is_err());

            let mut left: Vec<_> = std::fs::read_dir(outside.path())
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            left.sort();
            assert_eq!(left, vec![std::ffi::OsString::from("secret")]);
            assert_eq!(std::fs::read(dir.path().join("inside")).unwrap(), b"inside");
            c.clunk(1).await.unwrap();
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn unix_dialect() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::write(dir.path().join("two"), b"22").unwrap();
    std::os::unix::fs::symlink("one", dir.path().join("three")).unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            assert_eq!(c.version("9P2000.u").await.1, b"9P2000.u");
            c.attach(0).await.unwrap();

            // Errors carry a message as well as a code.
            assert_eq!(c.walk(0, 1, &["nope"]).await, Err(ENOENT));
            assert_eq!(
                c.rpc::<LinuxStat>(Opcode::Tgetattr, &(0u32, 0u64)).await,
                Err(EOPNOTSUPP)
            );

            c.walk(0, 1, &["three"]).await.unwrap();
            let (_, st): (u16, WireStat) = c.rpc(Opcode::Tstat, &1u32).await.unwrap();
            assert_eq!(st.name, b"three");
            assert_eq!(st.unix.unwrap().extension, b"one");

            c.walk(0, 2, &[]).await.unwrap();
            let _: (Qid, u32) = c.rpc(Opcode::Topen, &(2u32, 0u8)).await.unwrap();
            let mut data = c.read(2, 0, 4000).await.unwrap();
            let list = SgList::from_bytes(&data, 4000);
            let mut names = Vec::new();
            let mut pos = 0;
            while pos < data.len() {
                let (st, used) = unmarshal::<WireStat>(&list, pos, data.len()).unwrap();
                names.push(st.name);
                pos += used;
            }
            names.sort();
            assert_eq!(names, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
            data = c.read(2, data.len() as u64, 4000).await.unwrap();
            assert!(data.is_empty());

            // Create a directory, then rename it with wstat.
            c.walk(0, 3, &[]).await.unwrap();
            let _: (Qid, u32) = c
                .rpc(
                    Opcode::Tcreate,
                    &(3u32, b"sub".to_vec(), 0x8000_01edu32, 0u8, Vec::new()),
                )
                .await
                .unwrap();
            assert!(dir.path().join("sub").is_dir());
            let mut ws = WireStat::dont_touch(true);
            ws.name = b"renamed".to_vec();
            c.rpc::<()>(Opcode::Twstat, &(3u32, ws.wire_len() as u16, ws))
                .await
                .unwrap();
            assert!(dir.path().join("renamed").is_dir());
            let (_, st): (u16, WireStat) = c.rpc(Opcode::Tstat, &3u32).await.unwrap();
            assert_eq!(st.name, b"renamed");

            c.rpc::<()>(Opcode::Tremove, &3u32).await.unwrap();
            assert!(!dir.path().join("renamed").exists());
            assert_eq!(c.clunk(3).await, Err(ENOENT));
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn version_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, session, handle) = start(dir.path(), roomy_budget());
            assert_eq!(c.version("9P2000.x").await, (MSIZE, b"unknown".to_vec()));
            assert_eq!(
                c.rpc::<(u32, Vec<u8>)>(Opcode::Tversion, &(1024u32, b"9P2000.L".to_vec()))
                    .await,
                Err(90)
            );
            c.version("9P2000.L").await;
            c.attach(0).await.unwrap();
            let (msize, _): (u32, Vec<u8>) = c
                .rpc(Opcode::Tversion, &(1u32 << 30, b"9P2000.L".to_vec()))
                .await
                .unwrap();
            assert_eq!(msize, MSIZE);
            // Renegotiating starts the session over.
            assert!(session.with_fids(|t| t.is_empty()));
            assert_eq!(
                c.rpc::<()>(Opcode::Tauth, &(1u32, Vec::<u8>::new(), Vec::<u8>::new(), 0u32))
                    .await,
                Err(EOPNOTSUPP)
            );
            assert_eq!(c.rpc::<()>(Opcode::Rclunk, &()).await, Err(EOPNOTSUPP));
            stop(c, handle).await;
        })
        .await;
}

#[tokio::test]
async fn bad_framing_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let (mut c, _session, handle) = start(dir.path(), roomy_budget());
            c.wr.write_all(&[3, 0, 0, 0, 100, 0, 0]).await.unwrap();
            match handle.await.unwrap() {
                Err(ServerError::InvalidSize(3)) => (),
                r => panic!("unexpected result {:?}", r),
            }
        })
        .await;
}

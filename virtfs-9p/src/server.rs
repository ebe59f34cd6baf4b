//! The request dispatcher.
//!
//! A server reads requests from a transport and serves each one as its own task on the current
//! thread.  Tasks suspend only while the worker pool runs file system calls for them, so replies
//! may go out in any order; the tag is what ties a reply to its request.

use crate::config::ServerConfig;
use crate::protocol::{Dialect, Opcode};
use crate::transport::{TransportReceiver, TransportSender};
use num_traits::FromPrimitive;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use virtfs_constants::error::Error;
use virtfs_constants::logger::Logger;
use virtfs_fs::backend::FileSystem;

#[cfg(feature = "unix")]
use virtfs_fs::backend::host::HostFs;

mod message;
mod ops;
mod session;

pub use message::{Message, MessagePool};
pub use session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid message size {0}")]
    InvalidSize(u32),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub struct Server {
    session: Rc<Session>,
    pool: MessagePool,
    logger: Arc<dyn Logger + Send + Sync>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        fs: Arc<dyn FileSystem>,
        logger: Arc<dyn Logger + Send + Sync>,
    ) -> Server {
        Server {
            pool: MessagePool::new(config.max_requests),
            session: Rc::new(Session::new(config, fs, logger.clone())),
            logger,
        }
    }

    /// Creates a server exporting `config.root` from the host file system.
    #[cfg(feature = "unix")]
    pub fn host(config: ServerConfig, logger: Arc<dyn Logger + Send + Sync>) -> Server {
        let fs = Arc::new(HostFs::new(config.root.clone()));
        Self::new(config, fs, logger)
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }

    /// Serves requests until the transport reports that the client is gone.
    ///
    /// This must be called from within a [`tokio::task::LocalSet`].  Requests still in flight
    /// when the client goes away are finished and their replies sent before this returns.
    pub async fn run<R, S>(&self, rx: &mut R, tx: &mut S) -> Result<(), ServerError>
    where
        R: TransportReceiver + ?Sized,
        S: TransportSender + ?Sized,
    {
        trace!(self.logger, "9P: starting server");
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let reader = async move {
            loop {
                let mut msg = self.pool.get().await;
                let element = match rx.receive().await? {
                    Some(element) => element,
                    None => break,
                };
                msg.load(element, self.session.msize())?;
                let session = self.session.clone();
                let done = done_tx.clone();
                tokio::task::spawn_local(async move {
                    let res = dispatch(&session, &mut msg).await;
                    if let Err(e) = res {
                        trace!(
                            session.logger,
                            "9P: tag {} failed: {} ({})",
                            hex::encode(msg.tag.to_le_bytes()),
                            e,
                            e.code()
                        );
                    }
                    msg.complete(res, session.dialect());
                    let _ = done.send(msg);
                });
            }
            trace!(self.logger, "9P: client closed the transport");
            Ok::<(), ServerError>(())
        };
        let writer = async {
            while let Some(mut msg) = done_rx.recv().await {
                let (element, len) = msg.finish();
                tx.send(element, len).await?;
                tx.notify().await?;
                self.pool.put(msg);
            }
            Ok::<(), ServerError>(())
        };
        tokio::try_join!(reader, writer)?;
        Ok(())
    }
}

/// Routes a request to its handler.
async fn dispatch(session: &Session, msg: &mut Message) -> Result<(), Error> {
    let dialect = session.dialect();
    let op = Opcode::from_u8(msg.opcode);
    trace!(
        session.logger,
        "9P: message {:?} ({:02x}) size {} tag {} {}",
        op,
        msg.opcode,
        msg.size,
        hex::encode(msg.tag.to_le_bytes()),
        dialect
    );
    let op = match op {
        Some(op) if op.is_linux_only() && dialect != Dialect::Linux => {
            return Err(Error::EOPNOTSUPP)
        }
        Some(op) if op.is_classic_only() && dialect == Dialect::Linux => {
            return Err(Error::EOPNOTSUPP)
        }
        Some(op) => op,
        None => return Err(Error::EOPNOTSUPP),
    };
    match op {
        Opcode::Tversion => session.tversion(msg).await,
        Opcode::Tattach => session.tattach(msg).await,
        Opcode::Tflush => session.tflush(msg).await,
        Opcode::Twalk => session.twalk(msg).await,
        Opcode::Topen => session.topen(msg).await,
        Opcode::Tcreate => session.tcreate(msg).await,
        Opcode::Tread => session.tread(msg).await,
        Opcode::Twrite => session.twrite(msg).await,
        Opcode::Tclunk => session.tclunk(msg).await,
        Opcode::Tremove => session.tremove(msg).await,
        Opcode::Tstat => session.tstat(msg).await,
        Opcode::Twstat => session.twstat(msg).await,
        Opcode::Tstatfs => session.tstatfs(msg).await,
        Opcode::Tlopen => session.tlopen(msg).await,
        Opcode::Tlcreate => session.tlcreate(msg).await,
        Opcode::Tsymlink => session.tsymlink(msg).await,
        Opcode::Tmknod => session.tmknod(msg).await,
        Opcode::Trename => session.trename(msg).await,
        Opcode::Treadlink => session.treadlink(msg).await,
        Opcode::Tgetattr => session.tgetattr(msg).await,
        Opcode::Tsetattr => session.tsetattr(msg).await,
        Opcode::Txattrwalk => session.txattrwalk(msg).await,
        Opcode::Txattrcreate => session.txattrcreate(msg).await,
        Opcode::Treaddir => session.treaddir(msg).await,
        Opcode::Tfsync => session.tfsync(msg).await,
        Opcode::Tlock => session.tlock(msg).await,
        Opcode::Tgetlock => session.tgetlock(msg).await,
        Opcode::Tlink => session.tlink(msg).await,
        Opcode::Tmkdir => session.tmkdir(msg).await,
        Opcode::Trenameat => session.trenameat(msg).await,
        Opcode::Tunlinkat => session.tunlinkat(msg).await,
        // Tauth, Terror, Tlerror and every reply type.
        _ => Err(Error::EOPNOTSUPP),
    }
}

#[cfg(test)]
mod tests;

use super::ServerError;
use crate::codec::{Deserializer, Serializer, SgList, Wire, HEADER_SIZE};
use crate::protocol::{Dialect, Opcode};
use crate::transport::Element;
use std::cell::RefCell;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use virtfs_constants::error::Error;

/// One request being served, together with the buffer its reply goes into.
///
/// A message is owned by exactly one handler from the time it is loaded until its reply has
/// been handed back to the transport.
#[derive(Default)]
pub struct Message {
    pub size: u32,
    pub opcode: u8,
    pub tag: u16,
    element: Element,
    /// Next unread byte of the request.
    roff: usize,
    /// Next unwritten byte of the reply.
    woff: usize,
    /// The reply may not grow past this offset.
    limit: usize,
    permit: Option<OwnedSemaphorePermit>,
}

impl Message {
    /// Parses the header of a freshly received buffer.
    ///
    /// A declared size that disagrees with the buffers is fatal to the connection.
    pub fn load(&mut self, element: Element, msize: u32) -> Result<(), ServerError> {
        let avail = element.out_sg.len();
        let mut d = Deserializer::new(&element.out_sg, 0, avail);
        let (size, opcode, tag) = match (d.read_u32(), d.read_u8(), d.read_u16()) {
            (Ok(size), Ok(opcode), Ok(tag)) => (size, opcode, tag),
            _ => return Err(ServerError::InvalidSize(avail as u32)),
        };
        if (size as usize) < HEADER_SIZE
            || size as usize != avail
            || element.in_sg.len() < HEADER_SIZE
        {
            return Err(ServerError::InvalidSize(size));
        }
        self.size = size;
        self.opcode = opcode;
        self.tag = tag;
        self.roff = HEADER_SIZE;
        self.woff = HEADER_SIZE;
        self.limit = element.in_sg.len().min(msize as usize);
        self.element = element;
        Ok(())
    }

    pub fn read<T: Wire>(&mut self) -> Result<T, Error> {
        let mut d = Deserializer::new(&self.element.out_sg, self.roff, self.size as usize);
        let val = d.read()?;
        self.roff = d.offset();
        Ok(val)
    }

    pub fn write<T: Wire>(&mut self, val: &T) -> Result<(), Error> {
        let mut s = Serializer::new(&mut self.element.in_sg, self.woff, self.limit);
        s.write(val)?;
        self.woff = s.offset();
        Ok(())
    }

    /// Appends raw bytes to the reply.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut s = Serializer::new(&mut self.element.in_sg, self.woff, self.limit);
        s.write_data(data)?;
        self.woff = s.offset();
        Ok(())
    }

    /// Copies request bytes claimed with [`Message::request_payload`].
    pub fn copy_request(&self, off: usize, dst: &mut [u8]) -> Result<(), Error> {
        self.element.out_sg.read_at(off, dst)
    }

    /// Bytes still free in the reply.
    pub fn response_room(&self) -> usize {
        self.limit.saturating_sub(self.woff)
    }

    pub fn response_offset(&self) -> usize {
        self.woff
    }

    /// Claims `len` bytes of the reply to be filled later, returning their offset.
    pub fn reserve(&mut self, len: usize) -> Result<usize, Error> {
        let mut s = Serializer::new(&mut self.element.in_sg, self.woff, self.limit);
        let off = s.write_view(len)?;
        self.woff = s.offset();
        Ok(off)
    }

    /// Fills in a value at an offset claimed earlier with [`Message::reserve`].
    pub fn patch<T: Wire>(&mut self, off: usize, val: &T) -> Result<(), Error> {
        let mut s = Serializer::new(&mut self.element.in_sg, off, self.woff);
        s.write(val)
    }

    /// Claims up to `len` bytes of request payload, returning its offset and capped length.
    pub fn request_payload(&mut self, len: usize) -> (usize, usize) {
        let mut d = Deserializer::new(&self.element.out_sg, self.roff, self.size as usize);
        let view = d.read_view(len);
        self.roff = d.offset();
        view
    }

    pub fn take_request(&mut self) -> SgList {
        std::mem::take(&mut self.element.out_sg)
    }

    pub fn restore_request(&mut self, sg: SgList) {
        self.element.out_sg = sg;
    }

    pub fn take_response(&mut self) -> SgList {
        std::mem::take(&mut self.element.in_sg)
    }

    pub fn restore_response(&mut self, sg: SgList) {
        self.element.in_sg = sg;
    }

    /// Finishes the reply: an error body if `result` failed, then the header at offset 0.
    ///
    /// Returns the reply opcode.
    pub fn complete(&mut self, result: Result<(), Error>, dialect: Dialect) -> u8 {
        let opcode = match result {
            Ok(()) => self.opcode.wrapping_add(1),
            Err(e) => {
                self.woff = HEADER_SIZE;
                let body = if dialect.is_linux() {
                    self.write(&e.code())
                } else {
                    self.write(&(e.message().into_bytes(), e.code()))
                };
                if body.is_err() {
                    self.woff = HEADER_SIZE;
                }
                if dialect.is_linux() {
                    Opcode::Rlerror as u8
                } else {
                    Opcode::Rerror as u8
                }
            }
        };
        let mut s = Serializer::new(&mut self.element.in_sg, 0, HEADER_SIZE);
        // The header always fits; load checked the reply buffer's size.
        let _ = s.write(&(self.woff as u32, opcode, self.tag));
        opcode
    }

    /// Hands the buffer back for sending, with the length of the reply.
    pub fn finish(&mut self) -> (Element, usize) {
        let len = self.woff;
        self.woff = 0;
        (std::mem::take(&mut self.element), len)
    }
}

/// A bounded free list of messages.
///
/// Each message in flight holds a permit, so at most `capacity` requests are served at once and
/// the reader stops taking buffers from the transport until one is returned.
pub struct MessagePool {
    free: RefCell<Vec<Message>>,
    permits: Arc<Semaphore>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        MessagePool {
            free: RefCell::new((0..capacity).map(|_| Message::default()).collect()),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Waits for a free message.
    pub async fn get(&self) -> Message {
        let permit = self.permits.clone().acquire_owned().await.ok();
        let mut msg = self.free.borrow_mut().pop().unwrap_or_default();
        msg.permit = permit;
        msg
    }

    /// Returns a message to the free list.
    pub fn put(&self, mut msg: Message) {
        msg.element = Element::default();
        msg.roff = 0;
        msg.woff = 0;
        msg.permit = None;
        self.free.borrow_mut().push(msg);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

//! Hooks for distributed execution over a pluggable message transport.
//!
//! The core neither serializes values nor moves bytes itself. It decides *when* a message
//! is emitted — an item put whose `consumed_on` hint names other processes, a tag whose
//! `compute_on` hint names another process — and *what* the envelope metadata means. The
//! transport is an opaque [`Communicator`] supplied by the embedder; serialization over
//! tags and values is supplied per collection as a codec of user closures. Without a
//! transport everything runs locally and the hints are inert.

use std::sync::Arc;

use crate::context::ContextInner;
use crate::tuner::ConsumedOn;

/// One message between sibling collections on different processes.
///
/// The payload is opaque to the core; the envelope addresses the collection whose codec
/// can decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The collection identifier shared by the sibling contexts.
    pub collection: usize,
    /// What the payload encodes.
    pub kind: MessageKind,
    /// User-serialized bytes.
    pub payload: Vec<u8>,
}

/// The kinds of payload the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A (tag, value) pair put into an item-collection.
    Item,
    /// A tag put into a tag-collection.
    Tag,
}

/// A byte-buffer builder for codec authors; a small convenience, not a wire format.
#[derive(Debug, Default)]
pub struct Serializer {
    buffer: Vec<u8>,
}

impl Serializer {
    /// An empty serializer.
    pub fn new() -> Self {
        Serializer::default()
    }

    /// Append raw bytes.
    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// The accumulated payload.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// The receiver callback a context registers with the transport.
pub type Receiver = dyn Fn(Message, usize) + Send + Sync;

/// The narrow interface the core needs from a message transport.
///
/// Implementations deliver messages between the processes of one program; the core calls
/// `send`/`bcast` on puts with cross-process hints and registers one receiver per
/// distributed context.
pub trait Communicator: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;
    /// The number of cooperating processes.
    fn num_ranks(&self) -> usize;
    /// Deliver a message to one process.
    fn send(&self, message: Message, recipient: usize);
    /// Deliver a message to each of the given processes.
    fn bcast(&self, message: Message, recipients: &[usize]);
    /// Register the callback invoked for every arriving message, with the sender's rank.
    fn register_receiver(&self, receiver: Arc<Receiver>);
}

/// The default transport: one process, no peers, nothing to deliver.
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn send(&self, message: Message, recipient: usize) {
        log::warn!(
            "dropping message for collection {} to rank {}: no transport installed",
            message.collection,
            recipient
        );
    }

    fn bcast(&self, message: Message, recipients: &[usize]) {
        if !recipients.is_empty() {
            log::warn!(
                "dropping broadcast for collection {}: no transport installed",
                message.collection
            );
        }
    }

    fn register_receiver(&self, _receiver: Arc<Receiver>) {}
}

/// User-supplied serialization for the items of one collection.
pub struct ItemCodec<T, V> {
    pub(crate) encode: Arc<dyn Fn(&T, &V) -> Vec<u8> + Send + Sync>,
    pub(crate) decode: Arc<dyn Fn(&[u8]) -> Option<(T, V)> + Send + Sync>,
}

impl<T, V> ItemCodec<T, V> {
    /// A codec from an encode/decode closure pair.
    pub fn new(
        encode: impl Fn(&T, &V) -> Vec<u8> + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> Option<(T, V)> + Send + Sync + 'static,
    ) -> Self {
        ItemCodec { encode: Arc::new(encode), decode: Arc::new(decode) }
    }
}

impl<T, V> Clone for ItemCodec<T, V> {
    fn clone(&self) -> Self {
        ItemCodec { encode: self.encode.clone(), decode: self.decode.clone() }
    }
}

/// User-supplied serialization for the tags of one collection.
pub struct TagCodec<T> {
    pub(crate) encode: Arc<dyn Fn(&T) -> Vec<u8> + Send + Sync>,
    pub(crate) decode: Arc<dyn Fn(&[u8]) -> Option<T> + Send + Sync>,
}

impl<T> TagCodec<T> {
    /// A codec from an encode/decode closure pair.
    pub fn new(
        encode: impl Fn(&T) -> Vec<u8> + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        TagCodec { encode: Arc::new(encode), decode: Arc::new(decode) }
    }
}

impl<T> Clone for TagCodec<T> {
    fn clone(&self) -> Self {
        TagCodec { encode: self.encode.clone(), decode: self.decode.clone() }
    }
}

/// The other ranks that must receive an item, per its `consumed_on` hint. `None` when the
/// item stays local: no hint, no transport, or a hint naming only this process.
pub(crate) fn remote_ranks(
    ctx: &ContextInner,
    consumed: Option<ConsumedOn>,
) -> Option<Vec<usize>> {
    let consumed = consumed?;
    if !ctx.runtime.distributed() {
        return None;
    }
    let communicator = ctx.runtime.communicator();
    let mine = communicator.rank();
    let count = communicator.num_ranks();
    let ranks: Vec<usize> = match consumed {
        ConsumedOn::Local => return None,
        ConsumedOn::All => (0..count).filter(|rank| *rank != mine).collect(),
        ConsumedOn::Ranks(ranks) => {
            ranks.into_iter().filter(|rank| *rank != mine && *rank < count).collect()
        }
    };
    if ranks.is_empty() {
        None
    } else {
        Some(ranks)
    }
}

/// Emit an item to the sibling collections on `ranks`.
pub(crate) fn send_item<T, V>(
    ctx: &ContextInner,
    collection: usize,
    codec: &Option<ItemCodec<T, V>>,
    tag: &T,
    value: &V,
    ranks: &[usize],
) {
    let Some(codec) = codec else {
        log::warn!("item for collection {} not sent: no codec", collection);
        return;
    };
    let message = Message {
        collection,
        kind: MessageKind::Item,
        payload: (codec.encode)(tag, value),
    };
    ctx.runtime.communicator().bcast(message, ranks);
}

/// Emit a tag to the sibling collection on `rank`, which will prescribe there.
pub(crate) fn send_tag<T>(
    ctx: &ContextInner,
    collection: usize,
    codec: &Option<TagCodec<T>>,
    tag: &T,
    rank: usize,
) {
    let Some(codec) = codec else {
        log::warn!("tag for collection {} not sent: no codec", collection);
        return;
    };
    let message = Message { collection, kind: MessageKind::Tag, payload: (codec.encode)(tag) };
    ctx.runtime.communicator().send(message, rank);
}

/// Wire a context into the transport: arriving messages are dispatched to the addressed
/// collection's codec. The receiver holds a weak reference, so a dropped context simply
/// stops receiving.
pub(crate) fn register_receiver(ctx: &Arc<ContextInner>) {
    let weak = Arc::downgrade(ctx);
    ctx.runtime.communicator().register_receiver(Arc::new(move |message: Message, _sender| {
        if let Some(ctx) = weak.upgrade() {
            ctx.deliver(message.collection, &message.payload);
        }
    }));
}

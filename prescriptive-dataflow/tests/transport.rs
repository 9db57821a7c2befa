use std::sync::{Arc, Mutex};

use prescriptive_dataflow::dist::{Communicator, ItemCodec, Message, MessageKind, Receiver, TagCodec};
use prescriptive_dataflow::{
    ComputeOn, ConsumedOn, Context, ItemCollection, ItemTuner, Runtime, Settings,
    StepCollection, StepResult, StepTuner, TagCollection, TagTuner,
};

/// A transport double pretending to be rank 0 of 2: it records what the core emits and
/// exposes the receiver the core registers.
#[derive(Default)]
struct RecordingComm {
    sent: Mutex<Vec<(Message, usize)>>,
    bcast: Mutex<Vec<(Message, Vec<usize>)>>,
    receiver: Mutex<Option<Arc<Receiver>>>,
}

impl Communicator for RecordingComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        2
    }

    fn send(&self, message: Message, recipient: usize) {
        self.sent.lock().unwrap().push((message, recipient));
    }

    fn bcast(&self, message: Message, recipients: &[usize]) {
        self.bcast.lock().unwrap().push((message, recipients.to_vec()));
    }

    fn register_receiver(&self, receiver: Arc<Receiver>) {
        *self.receiver.lock().unwrap() = Some(receiver);
    }
}

fn distributed_runtime(comm: &Arc<RecordingComm>) -> Runtime {
    let runtime = Runtime::new(Settings {
        threads: 2,
        dist_mode: Some("test".to_owned()),
        ..Settings::default()
    });
    runtime.set_communicator(comm.clone());
    runtime
}

fn u32_item_codec() -> ItemCodec<u32, u32> {
    ItemCodec::new(
        |tag: &u32, value: &u32| {
            let mut payload = tag.to_le_bytes().to_vec();
            payload.extend_from_slice(&value.to_le_bytes());
            payload
        },
        |payload: &[u8]| {
            if payload.len() != 8 {
                return None;
            }
            let tag = u32::from_le_bytes(payload[0..4].try_into().ok()?);
            let value = u32::from_le_bytes(payload[4..8].try_into().ok()?);
            Some((tag, value))
        },
    )
}

fn u32_tag_codec() -> TagCodec<u32> {
    TagCodec::new(
        |tag: &u32| tag.to_le_bytes().to_vec(),
        |payload: &[u8]| Some(u32::from_le_bytes(payload.try_into().ok()?)),
    )
}

/// An item whose `consumed_on` hint names the other rank is broadcast to it.
#[test]
fn consumed_on_emits_item_messages() {
    let comm = Arc::new(RecordingComm::default());
    let runtime = distributed_runtime(&comm);
    let ctx = Context::new(&runtime);

    let tuner = ItemTuner::new()
        .consumed_on(|_: &u32| ConsumedOn::All)
        .codec(u32_item_codec());
    let items: ItemCollection<u32, u32> = ItemCollection::with_tuner(&ctx, "items", tuner);

    items.put(5, 50).unwrap();
    ctx.wait().unwrap();

    let bcast = comm.bcast.lock().unwrap();
    assert_eq!(bcast.len(), 1);
    let (message, recipients) = &bcast[0];
    assert_eq!(message.kind, MessageKind::Item);
    assert_eq!(recipients, &vec![1]);
    let mut expected = 5u32.to_le_bytes().to_vec();
    expected.extend_from_slice(&50u32.to_le_bytes());
    assert_eq!(message.payload, expected);
    assert_eq!(items.try_get(&5), Some(50), "the producing rank keeps its copy");
}

/// A tag whose step-collection computes on the other rank is sent there instead of
/// prescribing locally.
#[test]
fn compute_on_routes_tags_to_their_rank() {
    let comm = Arc::new(RecordingComm::default());
    let runtime = distributed_runtime(&comm);
    let ctx = Context::new(&runtime);

    let steps = StepCollection::with_tuner(
        &ctx,
        "remote_step",
        StepTuner::new().compute_on(|_: &u32| ComputeOn::Rank(1)),
        move |_: &u32| -> StepResult { panic!("must not execute on this rank") },
    );
    let tags: TagCollection<u32> =
        TagCollection::with_tuner(&ctx, "tags", TagTuner::new().codec(u32_tag_codec()));
    tags.prescribes(&steps);

    tags.put(9);
    ctx.wait().unwrap();

    let sent = comm.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (message, recipient) = &sent[0];
    assert_eq!(*recipient, 1);
    assert_eq!(message.kind, MessageKind::Tag);
    assert_eq!(message.payload, 9u32.to_le_bytes().to_vec());
    assert_eq!(ctx.statistics().steps_created, 0);
}

/// Messages delivered by the transport land in the addressed collection.
#[test]
fn delivery_dispatches_to_the_addressed_collection() {
    let comm = Arc::new(RecordingComm::default());
    let runtime = distributed_runtime(&comm);
    let ctx = Context::new(&runtime);

    // First registered collection gets identifier zero.
    let items: ItemCollection<u32, u32> =
        ItemCollection::with_tuner(&ctx, "items", ItemTuner::new().codec(u32_item_codec()));

    let receiver = comm.receiver.lock().unwrap().clone().expect("context registered a receiver");
    let mut payload = 5u32.to_le_bytes().to_vec();
    payload.extend_from_slice(&50u32.to_le_bytes());
    receiver(Message { collection: 0, kind: MessageKind::Item, payload }, 1);

    ctx.wait().unwrap();
    assert_eq!(items.try_get(&5), Some(50));
}

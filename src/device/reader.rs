//! Worker that drains the device and turns bytes into items.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::{DeviceLink, LineFramer};
use crate::error::DeviceFault;
use crate::instrument::Instrument;
use crate::item::{Envelope, Item};
use crate::queue::{DispatchQueue, Offer, Queue};
use crate::worker::{Tick, Worker, WorkerContext};

/// Reads the device, frames records and hands parsed items to the pipeline.
pub struct DeviceReader {
    link: DeviceLink,
    framer: LineFramer,
    instrument: Arc<dyn Instrument>,
    persist: Option<Queue<Envelope>>,
    direct: Option<DispatchQueue>,
    max_buffer_bytes: usize,
}

impl DeviceReader {
    /// A reader that frames records on `delimiter` and parses them with `instrument`.
    pub fn new(link: DeviceLink, instrument: Arc<dyn Instrument>, delimiter: &str) -> Self {
        Self {
            link,
            framer: LineFramer::new(delimiter),
            instrument,
            persist: None,
            direct: None,
            max_buffer_bytes: usize::MAX,
        }
    }

    /// Items are stored through this queue.
    pub fn with_persist(mut self, queue: Queue<Envelope>) -> Self {
        self.persist = Some(queue);
        self
    }

    /// Items are also offered straight to the dispatcher through this queue.
    pub fn with_direct_send(mut self, queue: DispatchQueue) -> Self {
        self.direct = Some(queue);
        self
    }

    /// Upper bound for a record still waiting for its delimiter.
    pub fn with_max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Bytes received since the last delimiter.
    pub fn buffer(&self) -> String {
        self.framer.buffer()
    }

    /// Feeds one chunk through the framer and the parser.
    ///
    /// Returns the number of items produced.
    pub fn process(&mut self, chunk: &[u8]) -> Result<usize, DeviceFault> {
        let records = self.framer.push(chunk);
        if self.framer.buffered_len() > self.max_buffer_bytes {
            let pending = self.framer.buffered_len();
            self.framer.clear();
            return Err(DeviceFault::ProcessData(format!(
                "{pending} bytes received without a record delimiter"
            )));
        }

        let mut produced = 0;
        for line in records {
            trace!(line = %line, "Received record");
            match self.instrument.parse(&line) {
                Some(item) => {
                    self.dispatch(item);
                    produced += 1;
                }
                None => debug!(line = %line, "Dropping unparseable record"),
            }
        }
        Ok(produced)
    }

    /// The NEW envelope goes to the persist queue before the item can reach
    /// the dispatcher, so a SENT envelope never overtakes it.
    fn dispatch(&self, item: Item) {
        if let Some(persist) = &self.persist {
            if let Offer::Full(envelope) | Offer::Closed(envelope) = persist.offer(Envelope::new(item.clone())) {
                error!(item_id = %envelope.item.id(), "Save queue rejected item");
            }
        }
        if let Some(direct) = &self.direct {
            match direct.offer(item) {
                Offer::Accepted => {}
                Offer::Full(item) | Offer::Closed(item) => {
                    warn!(item_id = %item.id(), "Send queue is full, item left for the backlog")
                }
            }
        }
    }
}

impl Worker for DeviceReader {
    fn name(&self) -> &'static str {
        "device-reader"
    }

    fn before_start(&mut self, _ctx: &WorkerContext) {
        if self.persist.is_none() {
            debug!("No save data in store");
        }
        if self.direct.is_none() {
            debug!("No send data in real time");
        }
    }

    fn tick(&mut self, ctx: &WorkerContext) -> Tick {
        let chunk = match self.link.port().read_available() {
            Ok(chunk) => chunk,
            Err(source) => {
                error!(error = %source, "Device disconnected");
                return ctx.fail(DeviceFault::LostConnection { source });
            }
        };
        if chunk.is_empty() {
            return Tick::Idle;
        }
        match self.process(&chunk) {
            Ok(_) => Tick::Idle,
            Err(fault) => ctx.fail(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockPort;
    use crate::device::Device;
    use crate::queue::Take;
    use chrono::Utc;

    /// Every non-empty line becomes an item; lines starting with '#' are noise.
    struct EchoInstrument;

    impl Instrument for EchoInstrument {
        fn name(&self) -> &str {
            "echo"
        }

        fn parse(&self, line: &str) -> Option<Item> {
            (!line.starts_with('#')).then(|| Item::builder(Utc::now()).build())
        }
    }

    fn reader() -> (DeviceReader, crate::device::mock::MockControl, Device) {
        let (port, control) = MockPort::new();
        let device = Device::new("mock", Box::new(port));
        let reader = DeviceReader::new(device.link().unwrap(), Arc::new(EchoInstrument), "\n");
        (reader, control, device)
    }

    #[test]
    fn accumulates_across_ticks_until_delimiter() {
        let (reader, control, _device) = reader();
        let persist = Queue::unbounded();
        let mut reader = reader.with_persist(persist.clone());
        let ctx = WorkerContext::new("device-reader", Queue::unbounded());

        control.feed("Hola");
        control.feed(" como esta");
        reader.tick(&ctx);
        reader.tick(&ctx);
        assert_eq!(reader.buffer(), "Hola como esta");
        assert!(persist.is_empty());

        control.feed("\n");
        reader.tick(&ctx);
        assert_eq!(persist.len(), 1);
        assert_eq!(reader.buffer(), "");
    }

    #[test]
    fn unparseable_lines_are_dropped() {
        let (reader, _control, _device) = reader();
        let persist = Queue::unbounded();
        let mut reader = reader.with_persist(persist.clone());
        assert_eq!(reader.process(b"# banner\nvalue\n").unwrap(), 1);
        assert_eq!(persist.len(), 1);
    }

    #[test]
    fn full_direct_queue_does_not_block_persistence() {
        let (reader, _control, _device) = reader();
        let persist = Queue::unbounded();
        let direct = DispatchQueue::bounded(1);
        let mut reader = reader
            .with_persist(persist.clone())
            .with_direct_send(direct.clone());

        assert_eq!(reader.process(b"a\nb\nc\nd\n").unwrap(), 4);
        assert_eq!(direct.len(), 1);
        assert_eq!(persist.len(), 4);
        match persist.try_take() {
            Take::Item(envelope) => assert_eq!(envelope.status, crate::item::Status::New),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stored_envelope_precedes_the_sent_acknowledgement() {
        use crate::item::Status;
        use std::thread;

        for _ in 0..200 {
            let (reader, _control, _device) = reader();
            let persist = Queue::unbounded();
            let direct = DispatchQueue::bounded(4);
            let mut reader = reader
                .with_persist(persist.clone())
                .with_direct_send(direct.clone());

            // Stands in for a dispatcher that publishes and is acknowledged at once.
            let acker = {
                let (direct, persist) = (direct.clone(), persist.clone());
                thread::spawn(move || loop {
                    match direct.try_take() {
                        Take::Item(item) => {
                            persist.offer(Envelope::sent(item));
                            return;
                        }
                        _ => thread::yield_now(),
                    }
                })
            };

            assert_eq!(reader.process(b"reading\n").unwrap(), 1);
            acker.join().unwrap();
            assert_eq!(persist.len(), 2);

            match persist.try_take() {
                Take::Item(envelope) => assert_eq!(envelope.status, Status::New),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn read_failure_reports_lost_connection() {
        let (mut reader, control, _device) = reader();
        let notice = Queue::unbounded();
        let ctx = WorkerContext::new("device-reader", notice.clone());

        control.unplug();
        assert_eq!(reader.tick(&ctx), Tick::Stop);
        assert!(!ctx.is_active());
        match notice.try_take() {
            Take::Item(n) => assert!(matches!(n.fault, DeviceFault::LostConnection { .. })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversized_partial_record_is_a_processing_fault() {
        let (reader, _control, _device) = reader();
        let mut reader = reader.with_max_buffer(8);
        let err = reader.process(b"0123456789").unwrap_err();
        assert!(matches!(err, DeviceFault::ProcessData(_)));
        assert_eq!(reader.buffer(), "");
    }
}

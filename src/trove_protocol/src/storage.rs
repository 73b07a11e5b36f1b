use crate::event::Event;

/// Append-only log of CBOR-encoded events.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    entries: Vec<Vec<u8>>,
    encoded_bytes: usize,
}

fn encode_event(event: &Event) -> Vec<u8> {
    let mut buf = vec![];
    if let Err(err) = ciborium::ser::into_writer(event, &mut buf) {
        panic!("bug: failed to encode event {event:?}: {err}");
    }
    buf
}

fn decode_event(bytes: &[u8]) -> Event {
    match ciborium::de::from_reader(bytes) {
        Ok(event) => event,
        Err(err) => panic!("bug: failed to decode event: {err}"),
    }
}

impl EventLog {
    pub fn record(&mut self, event: &Event) {
        let bytes = encode_event(event);
        self.encoded_bytes += bytes.len();
        self.entries.push(bytes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of the encoded log.
    pub fn encoded_bytes(&self) -> usize {
        self.encoded_bytes
    }

    pub fn get(&self, index: usize) -> Option<Event> {
        self.entries.get(index).map(|bytes| decode_event(bytes))
    }

    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(Vec::as_slice)
    }

    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.entries.iter().map(|bytes| decode_event(bytes))
    }

    pub fn get_events(&self, start: usize, length: usize) -> Vec<Event> {
        self.events().skip(start).take(length).collect()
    }
}

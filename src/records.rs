//! In-process PV records and their monitor subscriptions.
//!
//! This is the field-copy side of the crate: a [`Record`] owns a fixed
//! schema of named fields, every [`Subscription`] owns a private copy buffer
//! with one dirty bit per field, and [`Record::post`] runs one synchronous
//! dispatch wave over the subscribers in the order they attached. For each
//! subscriber the wave asks its filter (if it has one) whether to copy: on
//! yes the changed fields land in the copy buffer, the dirty bits are set
//! and the subscriber's doorbell rings; on no the cycle's changes are simply
//! never applied to that subscriber, so it can never observe a stale or
//! partial update.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::{
    distributor::{ConsumerFilter, DistributorRegistry},
    request::DistributorRequest,
};

/// Consumer identities are process-wide and never reused.
static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// A scalar PV field value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Long(i64),
    Double(f64),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Shared live view of a record's fields.
///
/// Filters hold one to stringify their distinguishing field at decision
/// time, so the view must stay valid independent of the record's subscriber
/// bookkeeping.
#[derive(Clone, Debug, Default)]
pub(crate) struct FieldTable {
    fields: Arc<Mutex<Vec<(String, FieldValue)>>>,
}

impl FieldTable {
    fn new(fields: Vec<(String, FieldValue)>) -> Self {
        FieldTable {
            fields: Arc::new(Mutex::new(fields)),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.fields.lock().unwrap().iter().position(|(n, _)| n == name)
    }

    /// Stringify one field, or the whole record when no field is resolved.
    pub fn stringify(&self, field: Option<usize>) -> String {
        let fields = self.fields.lock().unwrap();
        match field.and_then(|i| fields.get(i)) {
            Some((_, value)) => value.to_string(),
            None => fields
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn snapshot(&self) -> Vec<(String, FieldValue)> {
        self.fields.lock().unwrap().clone()
    }

    /// Apply changes by field name, returning the indices that changed.
    fn apply(&self, changes: &[(&str, FieldValue)]) -> Vec<usize> {
        let mut fields = self.fields.lock().unwrap();
        let mut changed = Vec::with_capacity(changes.len());
        for (name, value) in changes {
            match fields.iter().position(|(n, _)| n == name) {
                Some(i) => {
                    fields[i].1 = value.clone();
                    changed.push(i);
                }
                None => warn!("post to unknown field {name:?}"),
            }
        }
        changed
    }
}

struct CopyBuffer {
    fields: Vec<(String, FieldValue)>,
    dirty: Vec<bool>,
}

struct Subscriber {
    consumer: u64,
    filter: Option<ConsumerFilter>,
    buffer: Arc<Mutex<CopyBuffer>>,
    doorbell: mpsc::Sender<String>,
}

struct RecordInner {
    name: String,
    fields: FieldTable,
    subscribers: Vec<Subscriber>,
}

/// A named record with a fixed set of fields and any number of monitor
/// subscriptions. Clones share the same record.
#[derive(Clone)]
pub struct Record {
    inner: Arc<Mutex<RecordInner>>,
}

impl Record {
    pub fn new(name: &str, fields: &[(&str, FieldValue)]) -> Record {
        let fields = fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();
        Record {
            inner: Arc::new(Mutex::new(RecordInner {
                name: name.to_owned(),
                fields: FieldTable::new(fields),
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        self.inner.lock().unwrap().fields.clone()
    }

    /// Subscribe to every update of this record.
    pub fn subscribe(&self) -> Subscription {
        self.attach(None)
    }

    /// Subscribe through a data distributor.
    ///
    /// `request` is the mini-language described on [`DistributorRequest`].
    /// A request that cannot be honored (non-positive update quota) logs a
    /// warning and falls back to an undistributed subscription seeing every
    /// update.
    pub fn subscribe_distributed(
        &self,
        registry: &DistributorRegistry,
        request: &str,
    ) -> Subscription {
        self.attach(Some((registry, DistributorRequest::parse(request))))
    }

    fn attach(
        &self,
        distribute: Option<(&DistributorRegistry, DistributorRequest)>,
    ) -> Subscription {
        let consumer = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);
        let filter = distribute.and_then(|(registry, request)| {
            match ConsumerFilter::create(registry, consumer, &request, self) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    warn!("not distributing updates for consumer {consumer}: {e}");
                    None
                }
            }
        });
        let mut inner = self.inner.lock().unwrap();
        let fields = inner.fields.snapshot();
        let buffer = Arc::new(Mutex::new(CopyBuffer {
            dirty: vec![false; fields.len()],
            fields,
        }));
        let (doorbell, doorbell_recv) = mpsc::channel(32);
        debug!("record {}: consumer {consumer} subscribed", inner.name);
        inner.subscribers.push(Subscriber {
            consumer,
            filter,
            buffer: buffer.clone(),
            doorbell,
        });
        Subscription {
            consumer,
            record: self.inner.clone(),
            buffer,
            doorbell: doorbell_recv,
        }
    }

    /// Post field changes and run one dispatch wave over all subscribers.
    ///
    /// Changes naming unknown fields are logged and skipped; a post that
    /// changes nothing dispatches nothing.
    pub fn post(&self, changes: &[(&str, FieldValue)]) {
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.fields.apply(changes);
        if changed.is_empty() {
            return;
        }
        let snapshot = inner.fields.snapshot();
        let name = inner.name.clone();
        inner.subscribers.retain_mut(|subscriber| {
            let deliver = match subscriber.filter.as_mut() {
                Some(filter) => filter.decide(true),
                None => true,
            };
            if !deliver {
                trace!("record {name}: consumer {} not entitled", subscriber.consumer);
                return true;
            }
            let mut buffer = subscriber.buffer.lock().unwrap();
            for &i in &changed {
                buffer.fields[i].1 = snapshot[i].1.clone();
                buffer.dirty[i] = true;
            }
            drop(buffer);
            match subscriber.doorbell.try_send(name.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => {
                    debug!("record {name}: dropping dead consumer {}", subscriber.consumer);
                    false
                }
            }
        });
    }
}

/// A consumer's handle on a record subscription.
///
/// Delivered updates accumulate in a private copy buffer;
/// [`take`](Subscription::take) drains it, [`next`](Subscription::next)
/// waits for the doorbell first. Dropping the subscription deregisters the
/// consumer from the record and, through its filter, from the distributor.
pub struct Subscription {
    consumer: u64,
    record: Arc<Mutex<RecordInner>>,
    buffer: Arc<Mutex<CopyBuffer>>,
    doorbell: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn consumer_id(&self) -> u64 {
        self.consumer
    }

    /// Take the fields delivered since the last call, clearing their dirty
    /// bits. None when nothing new has been delivered.
    pub fn take(&self) -> Option<Vec<(String, FieldValue)>> {
        let mut buffer = self.buffer.lock().unwrap();
        let mut updated = Vec::new();
        for i in 0..buffer.fields.len() {
            if buffer.dirty[i] {
                buffer.dirty[i] = false;
                updated.push(buffer.fields[i].clone());
            }
        }
        if updated.is_empty() { None } else { Some(updated) }
    }

    /// Wait for the next delivered update.
    pub async fn next(&mut self) -> Option<Vec<(String, FieldValue)>> {
        loop {
            self.doorbell.recv().await?;
            if let Some(update) = self.take() {
                return Some(update);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.record.lock().unwrap();
        inner.subscribers.retain(|s| s.consumer != self.consumer);
    }
}

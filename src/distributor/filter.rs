use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{
    distributor::{Distributor, DistributorRegistry},
    records::{FieldTable, Record},
    request::DistributorRequest,
};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("nUpdatesPerConsumer must be positive, got {0}")]
    InvalidQuota(i64),
}

/// Per-consumer decision point between a record's dispatch wave and the
/// shared distributor state.
///
/// A filter registers its consumer with the distributor on construction and
/// deregisters it when dropped, tearing down emptied groups and unused
/// distributors along the way.
pub struct ConsumerFilter {
    consumer: u64,
    group_id: String,
    distributor: Arc<Distributor>,
    registry: DistributorRegistry,
    fields: FieldTable,
    /// Resolved distinguishing field; None distinguishes by the whole record
    field: Option<usize>,
    first_update: bool,
}

impl ConsumerFilter {
    /// Build a filter for one consumer subscription.
    ///
    /// Refuses a non-positive update quota; the caller is expected to fall
    /// back to undistributed delivery in that case. The distinguishing field
    /// in effect is the one established by the consumer's group, which for a
    /// later joiner may differ from the one requested.
    pub fn create(
        registry: &DistributorRegistry,
        consumer: u64,
        request: &DistributorRequest,
        record: &Record,
    ) -> Result<ConsumerFilter, FilterError> {
        if request.updates_per_consumer <= 0 {
            return Err(FilterError::InvalidQuota(request.updates_per_consumer));
        }
        let quota = request.updates_per_consumer.min(u32::MAX as i64) as u32;
        let distributor = registry.get_or_create(&request.distributor_id);
        let field_name = distributor.add_consumer(
            consumer,
            &request.group_id,
            &request.distinguishing_field,
            quota,
            request.mode,
        );
        let fields = record.field_table();
        let field = fields.resolve(&field_name);
        if field.is_none() {
            debug!("no field {field_name} on record, distinguishing updates by the whole record");
        }
        Ok(ConsumerFilter {
            consumer,
            group_id: request.group_id.clone(),
            distributor,
            registry: registry.clone(),
            fields,
            field,
            first_update: true,
        })
    }

    /// Decide whether the pending update should be copied to this consumer.
    ///
    /// The first invocation passes unconditionally: a consumer joining
    /// mid-stream has no prior value to compare against and must not sit
    /// waiting for its group's turn. That pass never reaches the
    /// distributor, so rotation state only ever reflects arbitrated
    /// deliveries.
    pub fn decide(&mut self, has_field_change: bool) -> bool {
        if !has_field_change {
            return false;
        }
        if self.first_update {
            self.first_update = false;
            return true;
        }
        let value = self.fields.stringify(self.field);
        self.distributor
            .update_consumer(self.consumer, &self.group_id, &value)
    }
}

impl Drop for ConsumerFilter {
    fn drop(&mut self) {
        self.distributor.remove_consumer(self.consumer, &self.group_id);
        self.registry.release_if_unused(&self.distributor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::new("TEST", &[("value", 0i64.into()), ("timeStamp", "t0".into())])
    }

    #[test]
    fn non_positive_quota_is_refused() {
        let registry = DistributorRegistry::new();
        let request = DistributorRequest::parse("nUpdatesPerConsumer:0");
        let result = ConsumerFilter::create(&registry, 1, &request, &record());
        assert!(matches!(result, Err(FilterError::InvalidQuota(0))));
        // refused before anything was registered
        assert!(registry.is_empty());
    }

    #[test]
    fn no_pending_change_is_never_copied() {
        let registry = DistributorRegistry::new();
        let request = DistributorRequest::parse("nUpdatesPerConsumer:1");
        let mut filter = ConsumerFilter::create(&registry, 1, &request, &record()).unwrap();
        assert!(!filter.decide(false));
        // the first-update pass is still available afterwards
        assert!(filter.decide(true));
    }

    #[test]
    fn first_decision_passes_then_arbitration_starts() {
        let registry = DistributorRegistry::new();
        let record = record();
        let request = DistributorRequest::parse("nUpdatesPerConsumer:1");
        let mut a = ConsumerFilter::create(&registry, 1, &request, &record).unwrap();
        let mut b = ConsumerFilter::create(&registry, 2, &request, &record).unwrap();

        record.post(&[("timeStamp", "t1".into())]);
        assert!(a.decide(true));
        assert!(b.decide(true));

        record.post(&[("timeStamp", "t2".into())]);
        assert!(a.decide(true));
        assert!(!b.decide(true));

        record.post(&[("timeStamp", "t3".into())]);
        assert!(!a.decide(true));
        assert!(b.decide(true));
    }

    #[test]
    fn drop_deregisters_consumer() {
        let registry = DistributorRegistry::new();
        let request = DistributorRequest::parse("distributorId:teardown");
        let filter = ConsumerFilter::create(&registry, 1, &request, &record()).unwrap();
        assert_eq!(registry.len(), 1);
        drop(filter);
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_field_falls_back_to_whole_record() {
        let registry = DistributorRegistry::new();
        let record = Record::new("BARE", &[("value", 0i64.into())]);
        // default distinguishing field timeStamp does not exist on the record
        let request = DistributorRequest::parse("nUpdatesPerConsumer:1");
        let mut a = ConsumerFilter::create(&registry, 1, &request, &record).unwrap();
        let mut b = ConsumerFilter::create(&registry, 2, &request, &record).unwrap();

        record.post(&[("value", 1i64.into())]);
        assert!(a.decide(true));
        assert!(b.decide(true));
        // whole-record stringification still distinguishes updates
        record.post(&[("value", 2i64.into())]);
        assert!(a.decide(true));
        assert!(!b.decide(true));
        record.post(&[("value", 3i64.into())]);
        assert!(!a.decide(true));
        assert!(b.decide(true));
    }
}

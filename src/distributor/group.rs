use tracing::trace;

/// Dispatch policy for a consumer group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Round robin: each logical update goes to exactly one member.
    OnePerGroup,
    /// Broadcast: every member sees each logical update, with the group's
    /// turn bounded by its update quota.
    AllInGroup,
}

/// Advance a rotation cursor by one position.
///
/// Past the last element the cursor becomes the sentinel (`None`), which
/// resets to the front on next use.
pub(crate) fn advance(cursor: &mut Option<usize>, len: usize) {
    *cursor = match *cursor {
        Some(i) if i + 1 < len => Some(i + 1),
        _ => None,
    };
}

/// Remove `items[pos]` and keep `cursor` on the same logical element.
///
/// Removing an element before the cursor shifts it down; removing the cursor
/// target leaves the cursor on the element that followed it, or the sentinel
/// if the target was last.
pub(crate) fn remove_at<T>(items: &mut Vec<T>, cursor: &mut Option<usize>, pos: usize) {
    items.remove(pos);
    if let Some(c) = *cursor {
        if pos < c {
            *cursor = Some(c - 1);
        } else if pos == c && c >= items.len() {
            *cursor = None;
        }
    }
}

/// Ordered membership and rotation state for one named group of consumers
/// sharing a distribution policy.
pub(crate) struct ConsumerGroup {
    id: String,
    distinguishing_field: String,
    quota: u32,
    mode: DispatchMode,
    /// Insertion order; round robin walks this front to back
    members: Vec<u64>,
    cursor: Option<usize>,
    /// Last distinguishing value this group acted on
    last_value: Option<String>,
    /// Logical updates delivered since the last rotation
    quota_counter: u32,
    /// Members served the current logical update (AllInGroup only)
    served: usize,
}

impl ConsumerGroup {
    pub fn new(id: &str, distinguishing_field: &str, quota: u32, mode: DispatchMode) -> Self {
        ConsumerGroup {
            id: id.to_owned(),
            distinguishing_field: distinguishing_field.to_owned(),
            quota,
            mode,
            members: Vec::new(),
            cursor: None,
            last_value: None,
            quota_counter: 0,
            served: 0,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn distinguishing_field(&self) -> &str {
        &self.distinguishing_field
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn add_member(&mut self, consumer: u64) {
        self.members.push(consumer);
    }

    /// Remove a consumer, keeping the rotation cursor on the member whose
    /// turn comes next. Returns false if the consumer is not a member.
    pub fn remove_member(&mut self, consumer: u64) -> bool {
        let Some(pos) = self.members.iter().position(|&m| m == consumer) else {
            return false;
        };
        remove_at(&mut self.members, &mut self.cursor, pos);
        true
    }

    /// The member currently entitled to updates. A sentinel cursor resets to
    /// the front of the membership.
    pub fn current_member(&mut self) -> Option<u64> {
        if self.members.is_empty() {
            return None;
        }
        let i = match self.cursor {
            Some(i) if i < self.members.len() => i,
            _ => {
                self.cursor = Some(0);
                0
            }
        };
        Some(self.members[i])
    }

    /// Record a round-robin dispatch of `value` to the cursor target.
    ///
    /// Returns true once the quota is consumed; the member cursor has then
    /// advanced and the group's turn is over.
    pub fn dispatch_single(&mut self, value: &str) -> bool {
        self.last_value = Some(value.to_owned());
        self.quota_counter += 1;
        if self.quota_counter >= self.quota {
            self.quota_counter = 0;
            advance(&mut self.cursor, self.members.len());
            trace!("group {}: quota consumed, rotating members", self.id);
            true
        } else {
            false
        }
    }

    /// Record a broadcast dispatch of `value` to one member.
    ///
    /// Returns true once every current member has been served and the group
    /// has consumed its quota of distinct updates.
    pub fn dispatch_all(&mut self, value: &str) -> bool {
        if self.last_value.as_deref() != Some(value) {
            self.last_value = Some(value.to_owned());
            self.quota_counter += 1;
            self.served = 1;
        } else {
            self.served += 1;
        }
        if self.served >= self.members.len() && self.quota_counter >= self.quota {
            self.quota_counter = 0;
            trace!("group {}: broadcast quota consumed", self.id);
            true
        } else {
            false
        }
    }
}

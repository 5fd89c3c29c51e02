// queue.rs

use std::collections::VecDeque;

use crate::request::{CancelHook, Pending};

/// FIFO of requests of one kind on one endpoint.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    items: VecDeque<Pending>,
}

impl RequestQueue {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&Pending> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Pending> {
        self.items.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<Pending> {
        self.items.pop_front()
    }

    pub fn push_back(&mut self, req: Pending) {
        self.items.push_back(req);
    }

    /// Queue ahead of ordinary data, but never in front of a request that
    /// has already been partially transferred.
    pub fn push_priority(&mut self, req: Pending) {
        let at = match self.items.front() {
            Some(front) if front.done > 0 => 1,
            _ => 0,
        };
        self.items.insert(at, req);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pending> {
        self.items.iter()
    }

    /// Take an unclaimed request out of the queue and settle its token.
    /// The flag is true when its owner had already cancelled it.
    pub fn remove_settled(&mut self, index: usize) -> Option<(Pending, bool)> {
        let req = self.items.get(index)?;
        let cancelled = match req.claim() {
            Some(hook) => {
                hook.finish();
                false
            }
            None => {
                assert!(req.claim_for_removal(), "request {} is claimed", req.id);
                true
            }
        };
        self.items.remove(index).map(|req| (req, cancelled))
    }

    /// Claim the front request. Requests the owner already cancelled are
    /// removed and returned in `cancelled`; the next front is tried.
    pub fn claim_front(&mut self, cancelled: &mut Vec<Pending>) -> Option<CancelHook> {
        while let Some(front) = self.items.front() {
            if let Some(hook) = front.claim() {
                return Some(hook);
            }
            assert!(
                front.claim_for_removal(),
                "request {} at queue front is neither claimable nor cancelled",
                front.id
            );
            if let Some(req) = self.items.pop_front() {
                cancelled.push(req);
            }
        }
        None
    }

    /// Remove every request whose owner has flagged it, except a claimed
    /// one, which is resolved by the engine on restore.
    pub fn take_cancelled(&mut self) -> Vec<Pending> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for req in self.items.drain(..) {
            if req.token.is_cancelled() && req.claim_for_removal() {
                taken.push(req);
            } else {
                kept.push_back(req);
            }
        }
        self.items = kept;
        taken
    }

    /// Cancel everything in the queue. Unclaimed requests are removed and
    /// returned; a claimed front only gets flagged.
    pub fn cancel_all(&mut self) -> Vec<Pending> {
        for req in &self.items {
            req.token.cancel();
        }
        self.take_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Operation;

    fn write(bytes: &[u8]) -> Pending {
        Pending::new(Operation::Write { data: bytes.to_vec() })
    }

    #[test]
    fn test_fifo_order() {
        let mut q = RequestQueue::default();
        let a = write(b"a");
        let b = write(b"b");
        let (ida, idb) = (a.id, b.id);
        q.push_back(a);
        q.push_back(b);
        assert_eq!(q.pop_front().map(|r| r.id), Some(ida));
        assert_eq!(q.pop_front().map(|r| r.id), Some(idb));
        assert!(q.is_empty());
    }

    #[test]
    fn test_priority_does_not_split_partial_write() {
        let mut q = RequestQueue::default();
        let mut partial = write(b"abc");
        partial.done = 1;
        let partial_id = partial.id;
        q.push_back(partial);

        let urgent = Pending::new(Operation::ImmediateChar(b'!'));
        let urgent_id = urgent.id;
        q.push_priority(urgent);
        assert_eq!(q.front().map(|r| r.id), Some(partial_id));
        assert_eq!(q.iter().position(|r| r.id == urgent_id), Some(1));

        let mut q = RequestQueue::default();
        q.push_back(write(b"xyz"));
        let urgent = Pending::new(Operation::ImmediateChar(b'!'));
        let urgent_id = urgent.id;
        q.push_priority(urgent);
        assert_eq!(q.front().map(|r| r.id), Some(urgent_id));
    }

    #[test]
    fn test_claim_skips_cancelled_front() {
        let mut q = RequestQueue::default();
        let a = write(b"a");
        let b = write(b"b");
        let idb = b.id;
        a.token.cancel();
        q.push_back(a);
        q.push_back(b);

        let mut cancelled = Vec::new();
        let hook = q.claim_front(&mut cancelled).expect("b is claimable");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(q.front().map(|r| r.id), Some(idb));
        assert!(hook.restore());
    }

    #[test]
    fn test_cancel_all_leaves_claimed_front_flagged() {
        let mut q = RequestQueue::default();
        q.push_back(write(b"a"));
        q.push_back(write(b"b"));
        let mut cancelled = Vec::new();
        let hook = q.claim_front(&mut cancelled).unwrap();

        let removed = q.cancel_all();
        assert_eq!(removed.len(), 1);
        assert_eq!(q.iter().count(), 1);
        assert!(!hook.restore(), "restore must observe the cancel");
        assert!(q.front().is_some_and(|r| r.token.is_done()));
    }

    #[test]
    fn test_remove_settled_reports_owner_cancel() {
        let mut q = RequestQueue::default();
        let a = write(b"a");
        a.token.cancel();
        q.push_back(a);
        q.push_back(write(b"b"));

        let (_, cancelled) = q.remove_settled(0).unwrap();
        assert!(cancelled);
        let (b, cancelled) = q.remove_settled(0).unwrap();
        assert!(!cancelled);
        assert!(b.token.is_done());
        assert!(q.remove_settled(0).is_none());
    }
}

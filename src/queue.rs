//! Ordered queues of timed message nodes.
//!
//! Both the send queue (pending confirmable transmissions, earliest
//! deadline first) and the receive queue (parsed datagrams in arrival
//! order) are [`TransmitQueue`]s: singly-linked lists of owned nodes
//! sorted by tick.  A node strictly earlier than the head becomes the new
//! head; an equal deadline inserts *after* existing nodes.  The ordering
//! is stable but not symmetric, matching the strict-less comparator the
//! retransmission schedule was designed around.

use crate::clock::Ticks;
use crate::hash::TransactionId;
use crate::pdu::Pdu;
use crate::peer::PeerAddress;

/// One queued message: the owned PDU plus its scheduling state.
pub struct QueueNode {
    /// Scheduled tick: next retransmission deadline in the send queue,
    /// arrival tick in the receive queue.
    pub t: Ticks,
    /// Base retransmission timeout (jittered at send time).
    pub timeout: Ticks,
    pub retransmit_cnt: u32,
    pub id: TransactionId,
    pub remote: PeerAddress,
    pub pdu: Pdu,
    next: Option<Box<QueueNode>>,
}

impl QueueNode {
    pub fn new(t: Ticks, id: TransactionId, remote: PeerAddress, pdu: Pdu) -> Box<QueueNode> {
        Box::new(QueueNode {
            t,
            timeout: 0,
            retransmit_cnt: 0,
            id,
            remote,
            pdu,
            next: None,
        })
    }
}

#[derive(Default)]
pub struct TransmitQueue {
    head: Option<Box<QueueNode>>,
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Sorted insertion by scheduled tick, equal keys after existing ones.
    pub fn insert(&mut self, node: Box<QueueNode>) {
        Self::insert_after(&mut self.head, node);
    }

    fn insert_after(link: &mut Option<Box<QueueNode>>, mut node: Box<QueueNode>) {
        match link {
            Some(cur) if node.t >= cur.t => Self::insert_after(&mut cur.next, node),
            _ => {
                node.next = link.take();
                *link = Some(node);
            }
        }
    }

    pub fn peek_front(&self) -> Option<&QueueNode> {
        self.head.as_deref()
    }

    pub fn pop_front(&mut self) -> Option<Box<QueueNode>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        Some(node)
    }

    /// Unlinks the first node carrying `id`, if any.
    pub fn remove_by_id(&mut self, id: TransactionId) -> Option<Box<QueueNode>> {
        let mut link = &mut self.head;
        loop {
            match link {
                Some(cur) if cur.id == id => {
                    let mut node = link.take()?;
                    *link = node.next.take();
                    return Some(node);
                }
                Some(cur) => link = &mut cur.next,
                None => return None,
            }
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn clear(&mut self) {
        // iterative teardown; a dropped chain must not recurse in
        // proportion to the queue length
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

impl Drop for TransmitQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct Iter<'a> {
    next: Option<&'a QueueNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a QueueNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(node)
    }
}

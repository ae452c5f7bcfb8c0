//! A single-process, multi-thread stand-in for a real MPI-style transport. Every
//! simulated rank gets its own OS thread in test harnesses; ranks exchange messages over
//! `crossbeam_channel` queues instead of wire sockets. No `mpi`/`rsmpi` crate is pulled in
//! since nothing in this workspace's lineage depends on one; the `Communicator` trait is
//! the seam a real MPI backend would implement instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use slate_constants::SlateError;

use crate::communicator::Communicator;

struct Envelope {
    tag: u32,
    source: u32,
    payload: Vec<u8>,
}

/// One simulated rank's transport handle. Cloning a cluster's handles out to separate
/// threads is how tests exercise multi-rank behavior without a real cluster.
pub struct InProcessHandle {
    rank: u32,
    size: u32,
    senders: Arc<Vec<Sender<Envelope>>>,
    receiver: Receiver<Envelope>,
    pending: Mutex<VecDeque<Envelope>>,
}

impl InProcessHandle {
    fn take_matching(pending: &mut VecDeque<Envelope>, tag: u32) -> Option<Envelope> {
        let position = pending.iter().position(|envelope| envelope.tag == tag)?;
        pending.remove(position)
    }
}

impl Communicator for InProcessHandle {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, dest: u32, tag: u32, payload: Vec<u8>) -> Result<(), SlateError> {
        let sender = self.senders.get(dest as usize).ok_or_else(|| {
            SlateError::InvalidArgument(format!("rank {dest} is out of range for a cluster of size {}", self.size))
        })?;
        sender
            .send(Envelope {
                tag,
                source: self.rank,
                payload,
            })
            .map_err(|_| SlateError::TransferFailed(format!("rank {dest} is no longer reachable")))?;
        tracing::trace!(from = self.rank, to = dest, tag, "sent message");
        Ok(())
    }

    fn recv(&self, tag: u32) -> Result<(u32, Vec<u8>), SlateError> {
        {
            let mut pending = self.pending.lock().expect("transport pending queue lock poisoned");
            if let Some(envelope) = Self::take_matching(&mut pending, tag) {
                return Ok((envelope.source, envelope.payload));
            }
        }
        loop {
            let envelope = self
                .receiver
                .recv()
                .map_err(|_| SlateError::TransferFailed(format!("rank {} transport channel closed", self.rank)))?;
            if envelope.tag == tag {
                tracing::trace!(at = self.rank, from = envelope.source, tag, "received message");
                return Ok((envelope.source, envelope.payload));
            }
            self.pending.lock().expect("transport pending queue lock poisoned").push_back(envelope);
        }
    }
}

/// Builds the channel mesh for a cluster of `size` simulated ranks and returns one
/// [`InProcessHandle`] per rank, in rank order.
pub fn build_cluster(size: u32) -> Vec<InProcessHandle> {
    assert!(size > 0, "an in-process cluster requires at least one rank");
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded::<Envelope>()).unzip();
    let senders = Arc::new(senders);
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| InProcessHandle {
            rank: rank as u32,
            size,
            senders: Arc::clone(&senders),
            receiver,
            pending: Mutex::new(VecDeque::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_to_point_send_recv_round_trips() {
        let mut cluster = build_cluster(2);
        let rank1 = cluster.pop().expect("rank 1");
        let rank0 = cluster.pop().expect("rank 0");

        let handle = std::thread::spawn(move || rank1.recv(7).expect("recv on rank 1"));
        rank0.send(1, 7, vec![1, 2, 3]).expect("send from rank 0");
        let (source, payload) = handle.join().expect("thread joins");
        assert_eq!(source, 0);
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn recv_buffers_non_matching_tags_for_later() {
        let mut cluster = build_cluster(2);
        let rank1 = cluster.pop().expect("rank 1");
        let rank0 = cluster.pop().expect("rank 0");

        rank0.send(1, 99, vec![9]).expect("send tag 99");
        rank0.send(1, 5, vec![5]).expect("send tag 5");

        let (_, first) = rank1.recv(5).expect("recv tag 5 first");
        assert_eq!(first, vec![5]);
        let (_, second) = rank1.recv(99).expect("recv buffered tag 99");
        assert_eq!(second, vec![9]);
    }

    #[test]
    fn broadcast_delivers_root_payload_to_every_member() {
        let cluster = build_cluster(4);
        let members = vec![0, 1, 3];

        let mut handles = Vec::new();
        for handle in cluster {
            let rank = handle.rank();
            if !members.contains(&rank) {
                continue;
            }
            let members = members.clone();
            handles.push(std::thread::spawn(move || {
                let payload = if rank == 0 { Some(vec![42]) } else { None };
                handle.broadcast(0, &members, 1, payload).expect("broadcast")
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().expect("thread joins"), vec![42]);
        }
    }

    #[test]
    fn barrier_releases_every_member_only_after_all_arrive() {
        let cluster = build_cluster(3);
        let members = vec![0, 1, 2];

        let handles: Vec<_> = cluster
            .into_iter()
            .map(|handle| {
                let members = members.clone();
                std::thread::spawn(move || handle.barrier(&members))
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread joins").expect("barrier succeeds");
        }
    }

    #[test]
    fn send_to_out_of_range_rank_is_invalid_argument() {
        let cluster = build_cluster(2);
        let rank0 = &cluster[0];
        let error = rank0.send(9, 0, Vec::new()).expect_err("out of range rank must error");
        assert!(matches!(error, SlateError::InvalidArgument(_)));
    }
}

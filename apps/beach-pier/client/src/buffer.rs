//! Bounded holding area for live output received while a resync is in flight.

use std::collections::VecDeque;

use beach_pier_core::Seq;

#[derive(Debug)]
struct Piece {
    seq: Option<Seq>,
    text: String,
}

/// What is left to write once a snapshot lands.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Flush {
    pub pieces: Vec<(Option<Seq>, String)>,
    /// Output newer than the snapshot was evicted, so writing `pieces` would
    /// leave a hole in the display.
    pub gap: bool,
}

/// Keeps at most `capacity` bytes of text, evicting the oldest bytes first.
#[derive(Debug)]
pub struct ByteWindow {
    capacity: usize,
    pieces: VecDeque<Piece>,
    len: usize,
    lost_through: Option<Seq>,
    lost_unsequenced: bool,
}

impl ByteWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pieces: VecDeque::new(),
            len: 0,
            lost_through: None,
            lost_unsequenced: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, seq: Option<Seq>, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.len += text.len();
        self.pieces.push_back(Piece { seq, text });
        self.evict();
    }

    pub fn clear(&mut self) {
        self.pieces.clear();
        self.len = 0;
        self.lost_through = None;
        self.lost_unsequenced = false;
    }

    /// Empties the window, keeping only output the snapshot cut at `cut`
    /// does not already contain.
    pub fn drain_after(&mut self, cut: Option<Seq>) -> Flush {
        let gap = self.lost_unsequenced
            || match (self.lost_through, cut) {
                (Some(lost), Some(cut)) => lost > cut,
                (Some(_), None) => true,
                (None, _) => false,
            };
        let pieces = self
            .pieces
            .drain(..)
            .filter(|piece| match (piece.seq, cut) {
                (Some(seq), Some(cut)) => seq > cut,
                _ => true,
            })
            .map(|piece| (piece.seq, piece.text))
            .collect();
        self.clear();
        Flush { pieces, gap }
    }

    fn evict(&mut self) {
        while self.len > self.capacity {
            let overflow = self.len - self.capacity;
            let Some(front) = self.pieces.front_mut() else {
                break;
            };
            match front.seq {
                Some(seq) => {
                    self.lost_through = Some(self.lost_through.map_or(seq, |lost| lost.max(seq)));
                }
                None => self.lost_unsequenced = true,
            }
            if front.text.len() <= overflow {
                self.len -= front.text.len();
                self.pieces.pop_front();
                continue;
            }
            let mut cut = overflow;
            while !front.text.is_char_boundary(cut) {
                cut += 1;
            }
            front.text.drain(..cut);
            self.len -= cut;
        }
    }
}

//! Composable execution graphs of pieces
//!
//! A [`Block`] is built once, before the job starts, from pieces and control
//! flow. Building an [`ExecutionGraph`] numbers the pieces depth-first; from
//! then on the tree never changes and only the master's [`ExecutionCursor`]
//! moves through it.
//!
//! ```text
//!  Block::sequence([
//!      Block::piece(Init),                       piece 0
//!      Block::repeat_until(20, converged, ─┐
//!          Block::sequence([               │
//!              Block::piece(Propagate),    │     piece 1
//!              Block::piece(CheckDelta),   │     piece 2
//!          ])),                           ─┘
//!      Block::piece(Output),                     piece 3
//!  ])
//! ```
//!
//! Control-flow conditions and branch selectors run on the master, after the
//! master compute of the current piece, and typically read a [`Transfer`]
//! slot that master compute filled.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BspError, Result};
use crate::graph::GraphTypes;

pub mod cursor;
pub mod piece;

pub use cursor::{CursorSnapshot, ExecutionCursor};
pub use piece::{MasterDecision, Piece};

pub(crate) use piece::ErasedPiece;
use piece::PieceAdapter;

/// Position of a piece in depth-first order of its execution graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceId(pub u32);

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece-{}", self.0)
    }
}

/// Master-side condition of a repeat-until or if block
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

/// Master-side selector of a branch block; `None` skips the branch
pub type Selector = Arc<dyn Fn() -> Option<usize> + Send + Sync>;

/// Shared slot handing a value from master compute to block conditions
pub struct Transfer<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Transfer<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> Transfer<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Clone for Transfer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Transfer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Transfer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transfer").field(&*self.slot.lock()).finish()
    }
}

/// A tree of pieces and control flow
pub struct Block<G: GraphTypes> {
    kind: BlockKind<G>,
}

enum BlockKind<G: GraphTypes> {
    Piece(Box<dyn ErasedPiece<G>>),
    Sequence(Vec<Block<G>>),
    Repeat {
        times: u32,
        body: Box<Block<G>>,
    },
    RepeatUntil {
        max_iterations: u32,
        until: Condition,
        body: Box<Block<G>>,
    },
    If {
        condition: Condition,
        then: Box<Block<G>>,
        otherwise: Option<Box<Block<G>>>,
    },
    Branch {
        selector: Selector,
        children: Vec<Block<G>>,
    },
}

impl<G: GraphTypes> Block<G> {
    pub fn piece<P: Piece<G>>(piece: P) -> Self {
        Self {
            kind: BlockKind::Piece(Box::new(PieceAdapter::new(piece))),
        }
    }

    /// Run blocks one after another
    pub fn sequence(blocks: impl IntoIterator<Item = Block<G>>) -> Self {
        Self {
            kind: BlockKind::Sequence(blocks.into_iter().collect()),
        }
    }

    /// Run `body` exactly `times` times
    pub fn repeat(times: u32, body: Block<G>) -> Self {
        Self {
            kind: BlockKind::Repeat {
                times,
                body: Box::new(body),
            },
        }
    }

    /// Run `body` until `until` holds before an iteration, at most
    /// `max_iterations` times
    pub fn repeat_until(
        max_iterations: u32,
        until: impl Fn() -> bool + Send + Sync + 'static,
        body: Block<G>,
    ) -> Self {
        Self {
            kind: BlockKind::RepeatUntil {
                max_iterations,
                until: Arc::new(until),
                body: Box::new(body),
            },
        }
    }

    pub fn if_then(condition: impl Fn() -> bool + Send + Sync + 'static, then: Block<G>) -> Self {
        Self {
            kind: BlockKind::If {
                condition: Arc::new(condition),
                then: Box::new(then),
                otherwise: None,
            },
        }
    }

    pub fn if_then_else(
        condition: impl Fn() -> bool + Send + Sync + 'static,
        then: Block<G>,
        otherwise: Block<G>,
    ) -> Self {
        Self {
            kind: BlockKind::If {
                condition: Arc::new(condition),
                then: Box::new(then),
                otherwise: Some(Box::new(otherwise)),
            },
        }
    }

    /// Run the child chosen by `selector`
    ///
    /// An index outside `children` fails the job with
    /// [`BspError::TerminalMismatch`].
    pub fn branch(
        selector: impl Fn() -> Option<usize> + Send + Sync + 'static,
        children: impl IntoIterator<Item = Block<G>>,
    ) -> Self {
        Self {
            kind: BlockKind::Branch {
                selector: Arc::new(selector),
                children: children.into_iter().collect(),
            },
        }
    }
}

/// Immutable control-flow tree over piece ids
pub(crate) enum Node {
    Piece(PieceId),
    Sequence(Vec<Node>),
    Repeat {
        times: u32,
        body: Box<Node>,
    },
    RepeatUntil {
        max_iterations: u32,
        until: Condition,
        body: Box<Node>,
    },
    If {
        condition: Condition,
        then: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    Branch {
        selector: Selector,
        children: Vec<Node>,
    },
}

impl Node {
    pub(crate) fn child(&self, index: u32) -> Option<&Node> {
        let index = index as usize;
        match self {
            Node::Piece(_) => None,
            Node::Sequence(children) | Node::Branch { children, .. } => children.get(index),
            Node::Repeat { body, .. } | Node::RepeatUntil { body, .. } => {
                (index == 0).then_some(body.as_ref())
            }
            Node::If {
                then, otherwise, ..
            } => match index {
                0 => Some(then.as_ref()),
                1 => otherwise.as_deref(),
                _ => None,
            },
        }
    }

    /// Every piece in this subtree
    pub(crate) fn collect_pieces(&self, out: &mut Vec<PieceId>) {
        match self {
            Node::Piece(id) => out.push(*id),
            Node::Sequence(children) | Node::Branch { children, .. } => {
                for child in children {
                    child.collect_pieces(out);
                }
            }
            Node::Repeat { body, .. } | Node::RepeatUntil { body, .. } => body.collect_pieces(out),
            Node::If {
                then, otherwise, ..
            } => {
                then.collect_pieces(out);
                if let Some(otherwise) = otherwise {
                    otherwise.collect_pieces(out);
                }
            }
        }
    }
}

/// A block with its pieces numbered and ready to execute
pub struct ExecutionGraph<G: GraphTypes> {
    root: Node,
    pieces: Vec<Box<dyn ErasedPiece<G>>>,
}

impl<G: GraphTypes> ExecutionGraph<G> {
    /// Number the pieces depth-first
    ///
    /// The root is always wrapped in a sequence, so a single piece is a valid
    /// job.
    pub fn new(block: Block<G>) -> Self {
        let mut pieces = Vec::new();
        let root = match Self::flatten(block, &mut pieces) {
            node @ Node::Sequence(_) => node,
            node => Node::Sequence(vec![node]),
        };
        Self { root, pieces }
    }

    fn flatten(block: Block<G>, pieces: &mut Vec<Box<dyn ErasedPiece<G>>>) -> Node {
        match block.kind {
            BlockKind::Piece(mut piece) => {
                let id = PieceId(pieces.len() as u32);
                piece.bind(id);
                pieces.push(piece);
                Node::Piece(id)
            }
            BlockKind::Sequence(children) => Node::Sequence(
                children
                    .into_iter()
                    .map(|child| Self::flatten(child, pieces))
                    .collect(),
            ),
            BlockKind::Repeat { times, body } => Node::Repeat {
                times,
                body: Box::new(Self::flatten(*body, pieces)),
            },
            BlockKind::RepeatUntil {
                max_iterations,
                until,
                body,
            } => Node::RepeatUntil {
                max_iterations,
                until,
                body: Box::new(Self::flatten(*body, pieces)),
            },
            BlockKind::If {
                condition,
                then,
                otherwise,
            } => {
                let then = Box::new(Self::flatten(*then, pieces));
                let otherwise = otherwise.map(|block| Box::new(Self::flatten(*block, pieces)));
                Node::If {
                    condition,
                    then,
                    otherwise,
                }
            }
            BlockKind::Branch { selector, children } => Node::Branch {
                selector,
                children: children
                    .into_iter()
                    .map(|child| Self::flatten(child, pieces))
                    .collect(),
            },
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Name of a piece, for logs
    pub fn piece_name(&self, id: PieceId) -> Result<&str> {
        Ok(self.activate(id)?.name())
    }

    /// Look up a piece the cursor or a command selected
    pub(crate) fn activate(&self, id: PieceId) -> Result<&dyn ErasedPiece<G>> {
        self.pieces
            .get(id.0 as usize)
            .map(|piece| piece.as_ref())
            .ok_or_else(|| {
                BspError::TerminalMismatch(format!(
                    "{id} is not part of an execution graph with {} pieces",
                    self.pieces.len()
                ))
            })
    }

    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    /// Cursor positioned before the first piece
    pub fn cursor(&self) -> ExecutionCursor {
        ExecutionCursor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Types;
    use crate::reducer::CreateReducersApi;

    type G = Types<u64, u64, ()>;

    struct Noop(&'static str);

    impl Piece<G> for Noop {
        type Message = ();
        type Reducers = ();

        fn name(&self) -> &str {
            self.0
        }

        fn register_reducers(&self, _api: &mut CreateReducersApi) {}
    }

    #[test]
    fn test_pieces_numbered_depth_first() {
        let graph = ExecutionGraph::new(Block::sequence([
            Block::piece(Noop("a")),
            Block::repeat(
                2,
                Block::sequence([Block::piece(Noop("b")), Block::piece(Noop("c"))]),
            ),
            Block::if_then_else(|| true, Block::piece(Noop("d")), Block::piece(Noop("e"))),
        ]));

        assert_eq!(graph.num_pieces(), 5);
        let names: Vec<_> = (0..5)
            .map(|i| graph.piece_name(PieceId(i)).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_unknown_piece_is_terminal_mismatch() {
        let graph = ExecutionGraph::new(Block::piece(Noop("only")));
        assert!(graph.activate(PieceId(0)).is_ok());
        assert!(matches!(
            graph.activate(PieceId(1)),
            Err(BspError::TerminalMismatch(_))
        ));
    }

    #[test]
    fn test_transfer_is_shared() {
        let transfer = Transfer::new();
        let reader = transfer.clone();
        assert_eq!(reader.get(), None::<bool>);
        transfer.set(true);
        assert_eq!(reader.get(), Some(true));
        assert_eq!(reader.take(), Some(true));
        assert!(!transfer.is_set());
    }
}

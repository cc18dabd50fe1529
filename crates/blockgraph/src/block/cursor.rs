//! Master-side position in an execution graph

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ExecutionGraph, Node, PieceId};
use crate::error::{BspError, Result};
use crate::graph::GraphTypes;

/// One level of the walk: which child of the parent was entered, and how far
/// this node itself has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Frame {
    child: u32,
    state: u32,
}

/// Serializable form of an [`ExecutionCursor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    frames: Vec<Frame>,
    current: Option<PieceId>,
    started: bool,
    finished: bool,
}

/// Walks an [`ExecutionGraph`] one piece at a time
///
/// Frame states per node kind: sequences count entered children, repeats
/// count started iterations, and if/branch nodes flip to 1 once they chose a
/// child.
#[derive(Debug, Clone, Default)]
pub struct ExecutionCursor {
    frames: Vec<Frame>,
    current: Option<PieceId>,
    started: bool,
    finished: bool,
}

impl ExecutionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Piece selected by the last [`advance`](Self::advance)
    pub fn current(&self) -> Option<PieceId> {
        self.current
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Move to the next piece; `None` once the graph is exhausted
    ///
    /// Conditions and selectors of the nodes passed on the way are evaluated
    /// here, so this must run after the master compute that feeds them.
    pub fn advance<G: GraphTypes>(&mut self, graph: &ExecutionGraph<G>) -> Result<Option<PieceId>> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.frames = vec![Frame { child: 0, state: 0 }];
        } else if self.current.take().is_some() {
            self.frames.pop();
        }

        while let Some(depth) = self.frames.len().checked_sub(1) {
            let node = Self::node_at(graph.root(), &self.frames)?;
            let (next, state) = Self::step(node, self.frames[depth].state)?;
            self.frames[depth].state = state;

            let Some(child) = next else {
                self.frames.pop();
                continue;
            };
            let child_node = node.child(child).ok_or_else(|| {
                BspError::TerminalMismatch(format!("child {child} does not exist"))
            })?;
            self.frames.push(Frame { child, state: 0 });
            if let Node::Piece(id) = child_node {
                graph.activate(*id)?;
                self.current = Some(*id);
                return Ok(self.current);
            }
        }

        self.finished = true;
        Ok(None)
    }

    /// Child to enter next, if any, and the node's new state
    fn step(node: &Node, state: u32) -> Result<(Option<u32>, u32)> {
        Ok(match node {
            Node::Piece(_) => (None, state),
            Node::Sequence(children) => {
                if (state as usize) < children.len() {
                    (Some(state), state + 1)
                } else {
                    (None, state)
                }
            }
            Node::Repeat { times, .. } => {
                if state < *times {
                    (Some(0), state + 1)
                } else {
                    (None, state)
                }
            }
            Node::RepeatUntil {
                max_iterations,
                until,
                ..
            } => {
                if state < *max_iterations && !until() {
                    (Some(0), state + 1)
                } else {
                    (None, state)
                }
            }
            Node::If {
                condition,
                otherwise,
                ..
            } => {
                if state > 0 {
                    (None, state)
                } else if condition() {
                    (Some(0), 1)
                } else if otherwise.is_some() {
                    (Some(1), 1)
                } else {
                    (None, 1)
                }
            }
            Node::Branch { selector, children } => {
                if state > 0 {
                    return Ok((None, state));
                }
                match selector() {
                    Some(index) if index < children.len() => (Some(index as u32), 1),
                    Some(index) => {
                        return Err(BspError::TerminalMismatch(format!(
                            "branch selected child {index} of {}",
                            children.len()
                        )))
                    }
                    None => (None, 1),
                }
            }
        })
    }

    fn node_at<'g>(root: &'g Node, frames: &[Frame]) -> Result<&'g Node> {
        frames.iter().skip(1).try_fold(root, |node, frame| {
            node.child(frame.child).ok_or_else(|| {
                BspError::TerminalMismatch(format!("child {} does not exist", frame.child))
            })
        })
    }

    /// Pieces that may still run, including the current one
    pub fn reachable_pieces<G: GraphTypes>(&self, graph: &ExecutionGraph<G>) -> Result<BTreeSet<PieceId>> {
        let mut pieces = Vec::new();
        if !self.started {
            graph.root().collect_pieces(&mut pieces);
            return Ok(pieces.into_iter().collect());
        }
        pieces.extend(self.current);

        for depth in 0..self.frames.len() {
            let node = Self::node_at(graph.root(), &self.frames[..=depth])?;
            let state = self.frames[depth].state;
            match node {
                Node::Sequence(children) => {
                    for child in children.iter().skip(state as usize) {
                        child.collect_pieces(&mut pieces);
                    }
                }
                Node::Repeat { times, body } if state < *times => body.collect_pieces(&mut pieces),
                Node::RepeatUntil {
                    max_iterations,
                    body,
                    ..
                } if state < *max_iterations => body.collect_pieces(&mut pieces),
                _ => {}
            }
        }
        Ok(pieces.into_iter().collect())
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            frames: self.frames.clone(),
            current: self.current,
            started: self.started,
            finished: self.finished,
        }
    }

    /// Rebuild a cursor, checking that the snapshot fits `graph`
    pub fn restore<G: GraphTypes>(graph: &ExecutionGraph<G>, snapshot: CursorSnapshot) -> Result<Self> {
        if !snapshot.frames.is_empty() {
            let top = Self::node_at(graph.root(), &snapshot.frames)?;
            match (top, snapshot.current) {
                (Node::Piece(id), Some(current)) if *id == current => {}
                (Node::Piece(_), _) | (_, Some(_)) => {
                    return Err(BspError::TerminalMismatch(
                        "checkpointed cursor does not match the execution graph".into(),
                    ))
                }
                _ => {}
            }
        }
        Ok(Self {
            frames: snapshot.frames,
            current: snapshot.current,
            started: snapshot.started,
            finished: snapshot.finished,
        })
    }
}

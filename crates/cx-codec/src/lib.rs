#![forbid(unsafe_code)]

use cx_ast::{ActiveSet, MAX_DEPTH, Node};
use thiserror::Error;

const TAG_LEAF: u8 = 0;
const TAG_AND: u8 = 1;
const TAG_OR: u8 = 2;
const TAG_NOT: u8 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{kind} node has {count} children; the one-byte count field holds at most {max}", max = u8::MAX)]
    TooManyChildren { kind: &'static str, count: usize },
    #[error("identifier is {len} UTF-8 bytes; the two-byte length prefix holds at most {max}", max = u16::MAX)]
    IdentifierTooLong { len: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown node tag: {0}")]
    UnknownTag(u8),
    #[error("encoded condition ends mid-node")]
    UnexpectedEof,
    #[error("identifier bytes are not valid UTF-8")]
    InvalidUtf8,
    #[error("{remaining} trailing bytes after the root node")]
    TrailingBytes { remaining: usize },
    #[error("encoded nesting exceeds depth limit ({MAX_DEPTH})")]
    TooDeep,
}

/// Pre-order serialization: leaf = tag 0 + u16 big-endian length + UTF-8
/// bytes; and/or = tag 1/2 + u8 child count + children; not = tag 3 + child.
pub fn encode(node: &Node) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_node(node, &mut out)?;
    Ok(out)
}

fn encode_node(node: &Node, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match node {
        Node::Leaf { id } => {
            let bytes = id.as_bytes();
            let len = u16::try_from(bytes.len())
                .map_err(|_| EncodeError::IdentifierTooLong { len: bytes.len() })?;
            out.push(TAG_LEAF);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Node::And { children } => encode_list(TAG_AND, "AND", children, out)?,
        Node::Or { children } => encode_list(TAG_OR, "OR", children, out)?,
        Node::Not { child } => {
            out.push(TAG_NOT);
            encode_node(child, out)?;
        }
    }
    Ok(())
}

fn encode_list(
    tag: u8,
    kind: &'static str,
    children: &[Node],
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let count = u8::try_from(children.len()).map_err(|_| EncodeError::TooManyChildren {
        kind,
        count: children.len(),
    })?;
    out.push(tag);
    out.push(count);
    for child in children {
        encode_node(child, out)?;
    }
    Ok(())
}

struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_identifier(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_u16_be()? as usize;
        let raw = self.read_slice(len)?;
        std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Materializes the tree back from its encoded form. A stored condition is
/// exactly one tree, so leftover bytes are a decode error.
pub fn decode(bytes: &[u8]) -> Result<Node, DecodeError> {
    let mut cursor = ByteCursor::new(bytes);
    let node = decode_node(&mut cursor, 0)?;
    if cursor.remaining() > 0 {
        return Err(DecodeError::TrailingBytes {
            remaining: cursor.remaining(),
        });
    }
    Ok(node)
}

fn decode_node(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Node, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    match cursor.read_u8()? {
        TAG_LEAF => Ok(Node::Leaf {
            id: cursor.read_identifier()?.to_owned(),
        }),
        TAG_AND => Ok(Node::And {
            children: decode_children(cursor, depth)?,
        }),
        TAG_OR => Ok(Node::Or {
            children: decode_children(cursor, depth)?,
        }),
        TAG_NOT => Ok(Node::Not {
            child: Box::new(decode_node(cursor, depth + 1)?),
        }),
        tag => Err(DecodeError::UnknownTag(tag)),
    }
}

fn decode_children(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Vec<Node>, DecodeError> {
    let count = cursor.read_u8()? as usize;
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        children.push(decode_node(cursor, depth + 1)?);
    }
    Ok(children)
}

/// Evaluates the encoded condition in a single pass without materializing a
/// tree. AND/OR must walk every child even once the result is determined:
/// siblings share one cursor, and skipping a child's sub-tree would leave
/// the cursor pointing into the middle of it.
pub fn evaluate(bytes: &[u8], active: &ActiveSet) -> Result<bool, DecodeError> {
    let mut cursor = ByteCursor::new(bytes);
    evaluate_node(&mut cursor, active, 0)
}

fn evaluate_node(
    cursor: &mut ByteCursor<'_>,
    active: &ActiveSet,
    depth: usize,
) -> Result<bool, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    match cursor.read_u8()? {
        TAG_LEAF => Ok(active.contains(cursor.read_identifier()?)),
        TAG_AND => {
            let count = cursor.read_u8()?;
            let mut result = true;
            for _ in 0..count {
                // No early return: the cursor has to advance past every
                // sibling's encoded sub-tree.
                if !evaluate_node(cursor, active, depth + 1)? {
                    result = false;
                }
            }
            Ok(result)
        }
        TAG_OR => {
            let count = cursor.read_u8()?;
            let mut result = false;
            for _ in 0..count {
                if evaluate_node(cursor, active, depth + 1)? {
                    result = true;
                }
            }
            Ok(result)
        }
        TAG_NOT => Ok(!evaluate_node(cursor, active, depth + 1)?),
        tag => Err(DecodeError::UnknownTag(tag)),
    }
}

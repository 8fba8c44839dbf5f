//! Adaptive radix tree.
//!
//! Inner nodes grow through four layouts (4, 16, 48 and 256 children) as
//! they fill up, and compress single-child paths into a byte prefix. Keys are
//! escaped and terminated before insertion so that no stored key is a prefix
//! of another, which keeps every value in a leaf, and so that the byte order
//! of encoded keys matches the byte order of the raw keys. In-order traversal
//! therefore yields keys sorted, which range lookups rely on.

use std::cmp::Ordering;
use std::mem;
use std::ops::Bound;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// Escape `0x00` and `0x01` and append the terminator.
fn encode(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    for &b in key {
        match b {
            0x00 => out.extend_from_slice(&[ESCAPE, 0x01]),
            0x01 => out.extend_from_slice(&[ESCAPE, 0x02]),
            other => out.push(other),
        }
    }
    out.push(TERMINATOR);
    out
}

fn decode(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.iter();
    while let Some(&b) = bytes.next() {
        match b {
            TERMINATOR => break,
            ESCAPE => match bytes.next() {
                Some(0x01) => out.push(0x00),
                Some(_) => out.push(0x01),
                None => break,
            },
            other => out.push(other),
        }
    }
    out
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

enum Node<V> {
    Leaf(Box<Leaf<V>>),
    Inner(Box<Inner<V>>),
}

struct Leaf<V> {
    /// Full encoded key.
    key: Vec<u8>,
    value: V,
}

struct Inner<V> {
    /// Compressed path shared by every key below this node.
    prefix: Vec<u8>,
    children: Children<V>,
}

impl<V> Node<V> {
    fn leaf(key: Vec<u8>, value: V) -> Self {
        Node::Leaf(Box::new(Leaf { key, value }))
    }

    fn inner(prefix: Vec<u8>) -> Self {
        Node::Inner(Box::new(Inner {
            prefix,
            children: Children::N4(SortedNode::new()),
        }))
    }

    fn add_child(&mut self, byte: u8, child: Node<V>) {
        if let Node::Inner(inner) = self {
            inner.children.add(byte, child);
        }
    }
}

/// Node4 and Node16: parallel sorted key/child arrays.
struct SortedNode<V, const N: usize> {
    keys: [u8; N],
    children: Vec<Node<V>>,
}

impl<V, const N: usize> SortedNode<V, N> {
    fn new() -> Self {
        Self {
            keys: [0; N],
            children: Vec::with_capacity(N),
        }
    }

    fn position(&self, byte: u8) -> std::result::Result<usize, usize> {
        self.keys[..self.children.len()].binary_search(&byte)
    }

    fn find(&self, byte: u8) -> Option<&Node<V>> {
        self.position(byte).ok().map(|i| &self.children[i])
    }

    fn find_mut(&mut self, byte: u8) -> Option<&mut Node<V>> {
        self.position(byte).ok().map(move |i| &mut self.children[i])
    }

    fn is_full(&self) -> bool {
        self.children.len() == N
    }

    fn add(&mut self, byte: u8, child: Node<V>) {
        let len = self.children.len();
        if let Err(pos) = self.position(byte) {
            self.keys.copy_within(pos..len, pos + 1);
            self.keys[pos] = byte;
            self.children.insert(pos, child);
        }
    }

    fn into_entries(self) -> impl Iterator<Item = (u8, Node<V>)> {
        let keys = self.keys;
        self.children
            .into_iter()
            .enumerate()
            .map(move |(i, child)| (keys[i], child))
    }
}

/// Node48: a 256-entry byte index into 48 child slots. Zero means empty.
struct Node48<V> {
    index: [u8; 256],
    slots: Vec<Node<V>>,
}

/// Node256: directly indexed by byte.
struct Node256<V> {
    children: Vec<Option<Node<V>>>,
}

enum Children<V> {
    N4(SortedNode<V, 4>),
    N16(SortedNode<V, 16>),
    N48(Box<Node48<V>>),
    N256(Box<Node256<V>>),
}

impl<V> Children<V> {
    fn find(&self, byte: u8) -> Option<&Node<V>> {
        match self {
            Children::N4(n) => n.find(byte),
            Children::N16(n) => n.find(byte),
            Children::N48(n) => match n.index[byte as usize] {
                0 => None,
                slot => n.slots.get(slot as usize - 1),
            },
            Children::N256(n) => n.children[byte as usize].as_ref(),
        }
    }

    fn find_mut(&mut self, byte: u8) -> Option<&mut Node<V>> {
        match self {
            Children::N4(n) => n.find_mut(byte),
            Children::N16(n) => n.find_mut(byte),
            Children::N48(n) => match n.index[byte as usize] {
                0 => None,
                slot => n.slots.get_mut(slot as usize - 1),
            },
            Children::N256(n) => n.children[byte as usize].as_mut(),
        }
    }

    fn is_full(&self) -> bool {
        match self {
            Children::N4(n) => n.is_full(),
            Children::N16(n) => n.is_full(),
            Children::N48(n) => n.slots.len() == 48,
            Children::N256(_) => false,
        }
    }

    /// Caller guarantees `byte` has no child yet.
    fn add(&mut self, byte: u8, child: Node<V>) {
        if self.is_full() {
            self.grow();
        }
        match self {
            Children::N4(n) => n.add(byte, child),
            Children::N16(n) => n.add(byte, child),
            Children::N48(n) => {
                n.slots.push(child);
                n.index[byte as usize] = n.slots.len() as u8;
            }
            Children::N256(n) => n.children[byte as usize] = Some(child),
        }
    }

    fn grow(&mut self) {
        let old = mem::replace(self, Children::N4(SortedNode::new()));
        *self = match old {
            Children::N4(n) => {
                let mut next = SortedNode::<V, 16>::new();
                for (byte, child) in n.into_entries() {
                    next.add(byte, child);
                }
                Children::N16(next)
            }
            Children::N16(n) => {
                let mut next = Node48 {
                    index: [0; 256],
                    slots: Vec::with_capacity(48),
                };
                for (byte, child) in n.into_entries() {
                    next.slots.push(child);
                    next.index[byte as usize] = next.slots.len() as u8;
                }
                Children::N48(Box::new(next))
            }
            Children::N48(n) => {
                let Node48 { index, slots } = *n;
                let mut children: Vec<Option<Node<V>>> = (0..256).map(|_| None).collect();
                let mut slots: Vec<Option<Node<V>>> = slots.into_iter().map(Some).collect();
                for (byte, &slot) in index.iter().enumerate() {
                    if slot != 0 {
                        children[byte] = slots[slot as usize - 1].take();
                    }
                }
                Children::N256(Box::new(Node256 { children }))
            }
            full @ Children::N256(_) => full,
        };
    }

    /// Children in ascending byte order.
    fn ordered(&self) -> Vec<(u8, &Node<V>)> {
        match self {
            Children::N4(n) => n.keys.iter().copied().zip(n.children.iter()).collect(),
            Children::N16(n) => n.keys.iter().copied().zip(n.children.iter()).collect(),
            Children::N48(n) => (0..=255u8)
                .filter_map(|b| match n.index[b as usize] {
                    0 => None,
                    slot => n.slots.get(slot as usize - 1).map(|c| (b, c)),
                })
                .collect(),
            Children::N256(n) => (0..=255u8)
                .filter_map(|b| n.children[b as usize].as_ref().map(|c| (b, c)))
                .collect(),
        }
    }
}

/// Node counts by layout, logged after index builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub leaves: usize,
    pub node4: usize,
    pub node16: usize,
    pub node48: usize,
    pub node256: usize,
}

/// Ordered map from byte-string keys to values.
pub struct AdaptiveRadixTree<V> {
    root: Option<Node<V>>,
    len: usize,
}

impl<V> Default for AdaptiveRadixTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> AdaptiveRadixTree<V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, returning the previous value for the key if any.
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        let encoded = encode(key);
        let previous = match self.root.as_mut() {
            None => {
                self.root = Some(Node::leaf(encoded, value));
                None
            }
            Some(root) => insert_at(root, encoded, 0, value),
        };
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let encoded = encode(key);
        let mut node = self.root.as_ref()?;
        let mut depth = 0;
        loop {
            match node {
                Node::Leaf(leaf) => return (leaf.key == encoded).then_some(&leaf.value),
                Node::Inner(inner) => {
                    let end = depth + inner.prefix.len();
                    if encoded.get(depth..end)? != inner.prefix.as_slice() {
                        return None;
                    }
                    node = inner.children.find(*encoded.get(end)?)?;
                    depth = end + 1;
                }
            }
        }
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let encoded = encode(key);
        get_mut_at(self.root.as_mut()?, &encoded, 0)
    }

    /// Entries with keys inside the bounds, in ascending key order.
    pub fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<(Vec<u8>, &V)> {
        let lower = map_bound(lower);
        let upper = map_bound(upper);
        let mut out = Vec::new();
        if let Some(root) = self.root.as_ref() {
            let mut path = Vec::new();
            collect_range(root, &mut path, &lower, &upper, &mut out);
        }
        out
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> Vec<(Vec<u8>, &V)> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let mut stack: Vec<&Node<V>> = self.root.iter().collect();
        while let Some(node) = stack.pop() {
            match node {
                Node::Leaf(_) => stats.leaves += 1,
                Node::Inner(inner) => {
                    match inner.children {
                        Children::N4(_) => stats.node4 += 1,
                        Children::N16(_) => stats.node16 += 1,
                        Children::N48(_) => stats.node48 += 1,
                        Children::N256(_) => stats.node256 += 1,
                    }
                    stack.extend(inner.children.ordered().into_iter().map(|(_, c)| c));
                }
            }
        }
        stats
    }
}

fn insert_at<V>(node: &mut Node<V>, key: Vec<u8>, depth: usize, value: V) -> Option<V> {
    match node {
        Node::Leaf(leaf) => {
            if leaf.key == key {
                return Some(mem::replace(&mut leaf.value, value));
            }
            // Keys are terminated, so neither is a prefix of the other and
            // both have a byte at `split`.
            let split = depth + common_prefix(&leaf.key[depth..], &key[depth..]);
            let old_byte = leaf.key[split];
            let new_byte = key[split];
            let mut parent = Node::inner(key[depth..split].to_vec());
            parent.add_child(new_byte, Node::leaf(key, value));
            let old = mem::replace(node, parent);
            node.add_child(old_byte, old);
            None
        }
        Node::Inner(inner) => {
            let shared = common_prefix(&inner.prefix, &key[depth..]);
            if shared < inner.prefix.len() {
                let old_byte = inner.prefix[shared];
                let new_byte = key[depth + shared];
                let mut parent = Node::inner(inner.prefix[..shared].to_vec());
                inner.prefix.drain(..=shared);
                parent.add_child(new_byte, Node::leaf(key, value));
                let old = mem::replace(node, parent);
                node.add_child(old_byte, old);
                return None;
            }

            let depth = depth + shared;
            let byte = key[depth];
            if inner.children.find(byte).is_none() {
                inner.children.add(byte, Node::leaf(key, value));
                return None;
            }
            let child = inner.children.find_mut(byte)?;
            insert_at(child, key, depth + 1, value)
        }
    }
}

fn get_mut_at<'a, V>(node: &'a mut Node<V>, key: &[u8], depth: usize) -> Option<&'a mut V> {
    match node {
        Node::Leaf(leaf) => (leaf.key == key).then_some(&mut leaf.value),
        Node::Inner(inner) => {
            let end = depth + inner.prefix.len();
            if key.get(depth..end)? != inner.prefix.as_slice() {
                return None;
            }
            let child = inner.children.find_mut(*key.get(end)?)?;
            get_mut_at(child, key, end + 1)
        }
    }
}

fn map_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(k) => Bound::Included(encode(k)),
        Bound::Excluded(k) => Bound::Excluded(encode(k)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn bound_key(bound: &Bound<Vec<u8>>) -> Option<&[u8]> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.as_slice()),
        Bound::Unbounded => None,
    }
}

/// Compare a subtree path with the same-length head of a bound key.
fn cmp_head(path: &[u8], bound: &[u8]) -> Ordering {
    let n = path.len().min(bound.len());
    path[..n].cmp(&bound[..n])
}

fn above_lower(key: &[u8], lower: &Bound<Vec<u8>>) -> bool {
    match lower {
        Bound::Included(k) => key >= k.as_slice(),
        Bound::Excluded(k) => key > k.as_slice(),
        Bound::Unbounded => true,
    }
}

fn below_upper(key: &[u8], upper: &Bound<Vec<u8>>) -> bool {
    match upper {
        Bound::Included(k) => key <= k.as_slice(),
        Bound::Excluded(k) => key < k.as_slice(),
        Bound::Unbounded => true,
    }
}

fn collect_range<'a, V>(
    node: &'a Node<V>,
    path: &mut Vec<u8>,
    lower: &Bound<Vec<u8>>,
    upper: &Bound<Vec<u8>>,
    out: &mut Vec<(Vec<u8>, &'a V)>,
) {
    match node {
        Node::Leaf(leaf) => {
            if above_lower(&leaf.key, lower) && below_upper(&leaf.key, upper) {
                out.push((decode(&leaf.key), &leaf.value));
            }
        }
        Node::Inner(inner) => {
            let mark = path.len();
            path.extend_from_slice(&inner.prefix);
            for (byte, child) in inner.children.ordered() {
                path.push(byte);
                // Every key below starts with `path`: prune whole subtrees
                // that sort entirely outside the bounds.
                let too_low = bound_key(lower).is_some_and(|k| cmp_head(path, k) == Ordering::Less);
                let too_high =
                    bound_key(upper).is_some_and(|k| cmp_head(path, k) == Ordering::Greater);
                if too_high {
                    path.pop();
                    break;
                }
                if !too_low {
                    collect_range(child, path, lower, upper, out);
                }
                path.pop();
            }
            path.truncate(mark);
        }
    }
}

//! Page-resident B+tree mapping index keys to row references.
//!
//! Leaves hold sorted [`Entry`] cells and are linked both ways for range
//! scans. Interior cells pair a child page with the separator bounding it
//! from above: child `i` holds entries `>= separator[i-1]` and
//! `< separator[i]`, and the rightmost child has no separator. Entries are
//! unique because equal keys are ordered by row reference.
//!
//! The root page id never changes, so the catalog can store it once.

use std::{cmp::Ordering, mem, ops::Bound, sync::Arc};

use tracing::debug;

use crate::{
    storage::page_store::PageStore,
    types::{
        PAGE_CAPACITY, PageId, SLOT_DIRECTORY_ENTRY_SIZE, TransactionId,
        entry::{Entry, InteriorEntry, RowRef, compare_keys},
        error::DatabaseError,
        page::{Page, PageType},
        value::Value,
    },
};

/// Nodes below this many bytes are rebalanced with a sibling.
const MIN_FILL: usize = PAGE_CAPACITY / 4;

/// Largest leaf entry accepted, so any node split yields two valid halves.
pub const MAX_ENTRY_SIZE: usize = PAGE_CAPACITY / 4 - 16;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(Vec<Entry>),
    Interior(Vec<InteriorEntry>),
}

impl Node {
    fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    fn cell_sizes(&self) -> Vec<usize> {
        match self {
            Node::Leaf(entries) => entries
                .iter()
                .map(|entry| entry.serialized_size() + SLOT_DIRECTORY_ENTRY_SIZE)
                .collect(),
            Node::Interior(children) => children
                .iter()
                .map(|child| child.serialized_size() + SLOT_DIRECTORY_ENTRY_SIZE)
                .collect(),
        }
    }

    fn size(&self) -> usize {
        self.cell_sizes().iter().sum()
    }

    fn fits(&self) -> bool {
        self.size() <= PAGE_CAPACITY
    }

    /// Split near the byte midpoint. The separator is the first entry of the
    /// right half for leaves, and the left half's last separator for interior
    /// nodes (which then becomes the left half's rightmost child).
    fn split(self, page_id: PageId) -> Result<SplitResult, DatabaseError> {
        let sizes = self.cell_sizes();
        let half = sizes.iter().sum::<usize>() / 2;
        let mut mid = 0;
        let mut accumulated = 0;
        while mid < sizes.len() && (mid == 0 || accumulated + sizes[mid] <= half) {
            accumulated += sizes[mid];
            mid += 1;
        }
        let mid = mid.clamp(1, sizes.len().saturating_sub(1).max(1));

        match self {
            Node::Leaf(mut entries) => {
                let right = entries.split_off(mid);
                let separator = right.first().cloned().ok_or(DatabaseError::CorruptedPage {
                    page_id,
                    reason: "cannot split a leaf with a single entry".to_string(),
                })?;
                Ok(SplitResult {
                    left: Node::Leaf(entries),
                    right: Node::Leaf(right),
                    separator,
                })
            }
            Node::Interior(mut children) => {
                let right = children.split_off(mid);
                let separator = children
                    .last_mut()
                    .and_then(|last| last.separator.take())
                    .ok_or(DatabaseError::CorruptedPage {
                        page_id,
                        reason: "interior node split without a separator".to_string(),
                    })?;
                Ok(SplitResult {
                    left: Node::Interior(children),
                    right: Node::Interior(right),
                    separator,
                })
            }
        }
    }

    /// Concatenate two siblings, pulling the parent separator down between
    /// interior nodes.
    fn merge(left: Node, separator: Entry, right: Node, page_id: PageId) -> Result<Node, DatabaseError> {
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.extend(right);
                Ok(Node::Leaf(left))
            }
            (Node::Interior(mut left), Node::Interior(right)) => {
                if let Some(last) = left.last_mut() {
                    last.separator = Some(separator);
                }
                left.extend(right);
                Ok(Node::Interior(left))
            }
            _ => Err(DatabaseError::CorruptedPage {
                page_id,
                reason: "siblings at different tree levels".to_string(),
            }),
        }
    }
}

struct SplitResult {
    left: Node,
    right: Node,
    separator: Entry,
}

#[derive(Debug, Clone)]
struct NodePage {
    page_id: PageId,
    node: Node,
    prev: Option<PageId>,
    next: Option<PageId>,
}

impl NodePage {
    fn children_mut(&mut self) -> Result<&mut Vec<InteriorEntry>, DatabaseError> {
        match &mut self.node {
            Node::Interior(children) => Ok(children),
            Node::Leaf(_) => Err(DatabaseError::CorruptedPage {
                page_id: self.page_id,
                reason: "expected an interior node".to_string(),
            }),
        }
    }
}

fn load_node(pages: &PageStore, index_id: u64, page_id: PageId) -> Result<NodePage, DatabaseError> {
    let page = pages.read_page(page_id)?;
    if page.owner != index_id {
        return Err(DatabaseError::CorruptedPage {
            page_id,
            reason: format!("page belongs to {} instead of index {}", page.owner, index_id),
        });
    }
    let node = match page.page_type {
        PageType::IndexLeaf => Node::Leaf(
            page.cells()
                .map(|(_, cell)| Entry::from_bytes(cell).map(|(entry, _)| entry))
                .collect::<Result<_, _>>()?,
        ),
        PageType::IndexInterior => Node::Interior(
            page.cells()
                .map(|(_, cell)| InteriorEntry::from_bytes(cell))
                .collect::<Result<_, _>>()?,
        ),
        other => {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("expected an index node, found {:?}", other),
            });
        }
    };
    Ok(NodePage {
        page_id,
        node,
        prev: page.prev_page_id,
        next: page.next_page_id,
    })
}

/// Walk from the root to a leaf, taking at each interior node the first
/// child whose separator satisfies `goes_left` (or the rightmost child).
fn descend(
    pages: &PageStore,
    index_id: u64,
    root_page_id: PageId,
    goes_left: impl Fn(&Entry) -> bool,
) -> Result<(NodePage, Vec<(PageId, usize)>), DatabaseError> {
    let mut path = Vec::new();
    let mut page_id = root_page_id;
    loop {
        let node = load_node(pages, index_id, page_id)?;
        let child = match &node.node {
            Node::Leaf(_) => return Ok((node, path)),
            Node::Interior(children) => {
                let index = children
                    .iter()
                    .position(|child| child.separator.as_ref().is_none_or(&goes_left))
                    .ok_or(DatabaseError::CorruptedPage {
                        page_id,
                        reason: "interior node without a rightmost child".to_string(),
                    })?;
                path.push((page_id, index));
                children[index].child
            }
        };
        if path.len() > MAX_DEPTH {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: "index deeper than any valid tree".to_string(),
            });
        }
        page_id = child;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

/// Key bounds for a scan, compared with the index comparator.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Bound<Vec<Value>>,
    pub upper: Bound<Vec<Value>>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn eq(key: Vec<Value>) -> Self {
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn new(lower: Bound<Vec<Value>>, upper: Bound<Vec<Value>>) -> Self {
        Self { lower, upper }
    }

    fn above_lower(&self, key: &[Value]) -> bool {
        match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(bound) => compare_keys(key, bound) != Ordering::Less,
            Bound::Excluded(bound) => compare_keys(key, bound) == Ordering::Greater,
        }
    }

    fn below_upper(&self, key: &[Value]) -> bool {
        match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(bound) => compare_keys(key, bound) != Ordering::Greater,
            Bound::Excluded(bound) => compare_keys(key, bound) == Ordering::Less,
        }
    }
}

pub struct BTreeIndex {
    pages: Arc<PageStore>,
    name: String,
    index_id: u64,
    root_page_id: PageId,
    unique: bool,
}

impl BTreeIndex {
    /// Allocate an empty root leaf for a new index.
    pub fn create(pages: &PageStore, txn: TransactionId, index_id: u64) -> Result<PageId, DatabaseError> {
        let page_id = pages.allocate(txn)?;
        let page = Page::new(page_id, PageType::IndexLeaf).with_owner(index_id);
        pages.write_page(txn, &page)?;
        Ok(page_id)
    }

    pub fn open(
        pages: Arc<PageStore>,
        name: impl Into<String>,
        index_id: u64,
        root_page_id: PageId,
        unique: bool,
    ) -> Self {
        Self {
            pages,
            name: name.into(),
            index_id,
            root_page_id,
            unique,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    fn load(&self, page_id: PageId) -> Result<NodePage, DatabaseError> {
        load_node(&self.pages, self.index_id, page_id)
    }

    fn write_node(&self, txn: TransactionId, node: &NodePage) -> Result<(), DatabaseError> {
        let page_type = if node.node.is_leaf() {
            PageType::IndexLeaf
        } else {
            PageType::IndexInterior
        };
        let mut page = Page::new(node.page_id, page_type).with_owner(self.index_id);
        page.prev_page_id = node.prev;
        page.next_page_id = node.next;
        match &node.node {
            Node::Leaf(entries) => {
                for entry in entries {
                    page.insert_cell(&entry.to_bytes())?;
                }
            }
            Node::Interior(children) => {
                for child in children {
                    page.insert_cell(&child.to_bytes())?;
                }
            }
        }
        self.pages.write_page(txn, &page)
    }

    fn descend_to(&self, entry: &Entry) -> Result<(NodePage, Vec<(PageId, usize)>), DatabaseError> {
        descend(&self.pages, self.index_id, self.root_page_id, |separator| {
            entry.compare(separator) == Ordering::Less
        })
    }

    /// First row stored under `key`, if any.
    pub fn find(&self, key: &[Value]) -> Result<Option<RowRef>, DatabaseError> {
        let mut scan = self.scan(KeyRange::eq(key.to_vec()), ScanDirection::Ascending);
        scan.next().transpose().map(|entry| entry.map(|entry| entry.row_ref))
    }

    pub fn insert(
        &self,
        txn: TransactionId,
        key: Vec<Value>,
        row_ref: RowRef,
    ) -> Result<(), DatabaseError> {
        let entry = Entry::new(key, row_ref);
        if entry.serialized_size() > MAX_ENTRY_SIZE {
            return Err(DatabaseError::ConstraintViolation {
                details: format!(
                    "key of {} bytes exceeds the {} byte limit of index '{}'",
                    entry.serialized_size(),
                    MAX_ENTRY_SIZE,
                    self.name
                ),
            });
        }
        // NULL keys never collide.
        if self.unique
            && !entry.key.iter().any(Value::is_null)
            && self.find(&entry.key)?.is_some()
        {
            return Err(DatabaseError::DuplicateKey {
                index: self.name.clone(),
            });
        }

        let (mut leaf, path) = self.descend_to(&entry)?;
        let Node::Leaf(entries) = &mut leaf.node else {
            return Err(DatabaseError::CorruptedPage {
                page_id: leaf.page_id,
                reason: "descent ended on an interior node".to_string(),
            });
        };
        match entries.binary_search_by(|candidate| candidate.compare(&entry)) {
            Ok(_) => return Ok(()),
            Err(position) => entries.insert(position, entry),
        }
        self.insert_upward(txn, leaf, path)
    }

    fn insert_upward(
        &self,
        txn: TransactionId,
        mut node: NodePage,
        mut path: Vec<(PageId, usize)>,
    ) -> Result<(), DatabaseError> {
        loop {
            if node.node.fits() {
                return self.write_node(txn, &node);
            }
            let is_leaf = node.node.is_leaf();
            let split = mem::replace(&mut node.node, Node::Leaf(Vec::new())).split(node.page_id)?;

            if node.page_id == self.root_page_id {
                let left_id = self.pages.allocate(txn)?;
                let right_id = self.pages.allocate(txn)?;
                self.write_node(
                    txn,
                    &NodePage {
                        page_id: left_id,
                        node: split.left,
                        prev: None,
                        next: is_leaf.then_some(right_id),
                    },
                )?;
                self.write_node(
                    txn,
                    &NodePage {
                        page_id: right_id,
                        node: split.right,
                        prev: is_leaf.then_some(left_id),
                        next: None,
                    },
                )?;
                node.node = Node::Interior(vec![
                    InteriorEntry {
                        child: left_id,
                        separator: Some(split.separator),
                    },
                    InteriorEntry {
                        child: right_id,
                        separator: None,
                    },
                ]);
                node.prev = None;
                node.next = None;
                debug!(index = %self.name, left_id, right_id, "root split");
                return self.write_node(txn, &node);
            }

            let right_id = self.pages.allocate(txn)?;
            let mut right = NodePage {
                page_id: right_id,
                node: split.right,
                prev: None,
                next: None,
            };
            if is_leaf {
                right.prev = Some(node.page_id);
                right.next = node.next;
                if let Some(after_id) = node.next {
                    let mut after = self.load(after_id)?;
                    after.prev = Some(right_id);
                    self.write_node(txn, &after)?;
                }
                node.next = Some(right_id);
            }
            node.node = split.left;
            self.write_node(txn, &node)?;
            self.write_node(txn, &right)?;
            debug!(index = %self.name, page_id = node.page_id, right_id, "node split");

            let (parent_id, index) = path.pop().ok_or(DatabaseError::CorruptedPage {
                page_id: node.page_id,
                reason: "non-root node without a parent".to_string(),
            })?;
            let mut parent = self.load(parent_id)?;
            let children = parent.children_mut()?;
            let upper = children[index].separator.replace(split.separator);
            children.insert(
                index + 1,
                InteriorEntry {
                    child: right_id,
                    separator: upper,
                },
            );
            node = parent;
        }
    }

    /// Remove one entry. Returns whether it was present.
    pub fn delete(
        &self,
        txn: TransactionId,
        key: Vec<Value>,
        row_ref: RowRef,
    ) -> Result<bool, DatabaseError> {
        let entry = Entry::new(key, row_ref);
        let (mut leaf, path) = self.descend_to(&entry)?;
        let Node::Leaf(entries) = &mut leaf.node else {
            return Ok(false);
        };
        match entries.binary_search_by(|candidate| candidate.compare(&entry)) {
            Ok(position) => {
                entries.remove(position);
            }
            Err(_) => return Ok(false),
        }
        self.rebalance(txn, leaf, path)?;
        Ok(true)
    }

    fn rebalance(
        &self,
        txn: TransactionId,
        mut current: NodePage,
        mut path: Vec<(PageId, usize)>,
    ) -> Result<(), DatabaseError> {
        loop {
            if current.page_id == self.root_page_id {
                return self.shrink_root(txn, current);
            }
            if current.node.size() >= MIN_FILL {
                return self.write_node(txn, &current);
            }
            let Some((parent_id, index)) = path.pop() else {
                return self.write_node(txn, &current);
            };
            let mut parent = self.load(parent_id)?;
            let children = parent.children_mut()?;
            if children.len() < 2 {
                self.write_node(txn, &current)?;
                current = parent;
                continue;
            }

            // Prefer the left sibling.
            let (left_index, mut left, mut right) = if index > 0 {
                (index - 1, self.load(children[index - 1].child)?, current)
            } else {
                (index, current, self.load(children[index + 1].child)?)
            };
            let separator = children[left_index]
                .separator
                .clone()
                .ok_or(DatabaseError::CorruptedPage {
                    page_id: parent_id,
                    reason: "missing separator between siblings".to_string(),
                })?;
            let merged = Node::merge(
                mem::replace(&mut left.node, Node::Leaf(Vec::new())),
                separator,
                mem::replace(&mut right.node, Node::Leaf(Vec::new())),
                left.page_id,
            )?;

            if merged.fits() {
                left.node = merged;
                if left.node.is_leaf() {
                    left.next = right.next;
                    if let Some(after_id) = right.next {
                        let mut after = self.load(after_id)?;
                        after.prev = Some(left.page_id);
                        self.write_node(txn, &after)?;
                    }
                }
                let upper = children[left_index + 1].separator.take();
                children[left_index].separator = upper;
                children.remove(left_index + 1);
                self.write_node(txn, &left)?;
                self.pages.free(txn, right.page_id)?;
                debug!(index = %self.name, left = left.page_id, right = right.page_id, "nodes merged");
                current = parent;
                continue;
            }

            // Too large for one page: redistribute between the two.
            let split = merged.split(left.page_id)?;
            left.node = split.left;
            right.node = split.right;
            children[left_index].separator = Some(split.separator);
            self.write_node(txn, &left)?;
            self.write_node(txn, &right)?;
            return self.write_node(txn, &parent);
        }
    }

    // An interior root left with one child absorbs it.
    fn shrink_root(&self, txn: TransactionId, mut root: NodePage) -> Result<(), DatabaseError> {
        loop {
            let only_child = match &root.node {
                Node::Interior(children) if children.len() == 1 => children[0].child,
                _ => break,
            };
            let child = self.load(only_child)?;
            root.node = child.node;
            root.prev = None;
            root.next = None;
            self.pages.free(txn, only_child)?;
            debug!(index = %self.name, only_child, "root collapsed");
        }
        self.write_node(txn, &root)
    }

    /// Lazy scan over `range`. The returned scan can be rewound.
    pub fn scan(&self, range: KeyRange, direction: ScanDirection) -> BTreeScan {
        BTreeScan {
            pages: Arc::clone(&self.pages),
            index_id: self.index_id,
            root_page_id: self.root_page_id,
            range,
            direction,
            leaf: Vec::new(),
            position: 0,
            sibling: None,
            started: false,
            finished: false,
        }
    }
}

pub struct BTreeScan {
    pages: Arc<PageStore>,
    index_id: u64,
    root_page_id: PageId,
    range: KeyRange,
    direction: ScanDirection,
    leaf: Vec<Entry>,
    /// Ascending: next index to yield. Descending: entries left to yield.
    position: usize,
    sibling: Option<PageId>,
    started: bool,
    finished: bool,
}

impl BTreeScan {
    pub fn rewind(&mut self) {
        self.leaf.clear();
        self.position = 0;
        self.sibling = None;
        self.started = false;
        self.finished = false;
    }

    fn start(&mut self) -> Result<(), DatabaseError> {
        let (leaf, _) = match self.direction {
            ScanDirection::Ascending => {
                let lower = self.range.lower.clone();
                descend(&self.pages, self.index_id, self.root_page_id, |separator| {
                    match &lower {
                        Bound::Unbounded => true,
                        Bound::Included(key) => compare_keys(key, &separator.key) != Ordering::Greater,
                        Bound::Excluded(key) => compare_keys(key, &separator.key) == Ordering::Less,
                    }
                })?
            }
            ScanDirection::Descending => {
                let upper = self.range.upper.clone();
                descend(&self.pages, self.index_id, self.root_page_id, |separator| {
                    match &upper {
                        Bound::Unbounded => false,
                        Bound::Included(key) => compare_keys(key, &separator.key) == Ordering::Less,
                        Bound::Excluded(key) => compare_keys(key, &separator.key) != Ordering::Greater,
                    }
                })?
            }
        };
        self.enter(leaf);
        self.started = true;
        Ok(())
    }

    fn enter(&mut self, leaf: NodePage) {
        let entries = match leaf.node {
            Node::Leaf(entries) => entries,
            Node::Interior(_) => Vec::new(),
        };
        match self.direction {
            ScanDirection::Ascending => {
                self.position = 0;
                self.sibling = leaf.next;
            }
            ScanDirection::Descending => {
                self.position = entries.len();
                self.sibling = leaf.prev;
            }
        }
        self.leaf = entries;
    }

    fn advance(&mut self) -> Result<Option<Entry>, DatabaseError> {
        if !self.started {
            self.start()?;
        }
        loop {
            if self.finished {
                return Ok(None);
            }
            let candidate = match self.direction {
                ScanDirection::Ascending if self.position < self.leaf.len() => {
                    self.position += 1;
                    Some(&self.leaf[self.position - 1])
                }
                ScanDirection::Descending if self.position > 0 => {
                    self.position -= 1;
                    Some(&self.leaf[self.position])
                }
                _ => None,
            };

            match candidate {
                Some(entry) => {
                    let (before_start, past_end) = match self.direction {
                        ScanDirection::Ascending => (
                            !self.range.above_lower(&entry.key),
                            !self.range.below_upper(&entry.key),
                        ),
                        ScanDirection::Descending => (
                            !self.range.below_upper(&entry.key),
                            !self.range.above_lower(&entry.key),
                        ),
                    };
                    if past_end {
                        self.finished = true;
                        return Ok(None);
                    }
                    if !before_start {
                        return Ok(Some(entry.clone()));
                    }
                }
                None => match self.sibling {
                    Some(page_id) => {
                        let leaf = load_node(&self.pages, self.index_id, page_id)?;
                        self.enter(leaf);
                    }
                    None => self.finished = true,
                },
            }
        }
    }
}

impl Iterator for BTreeScan {
    type Item = Result<Entry, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

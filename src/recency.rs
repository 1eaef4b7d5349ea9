use tracing::trace;

/// Handle to a node of a [`RecencyList`]. A handle goes stale once its node is
/// removed; stale handles are rejected even if the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

/// Doubly linked list over an arena of slots. Front is least recently used,
/// back is most recently used.
#[derive(Debug)]
pub struct RecencyList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for RecencyList<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> RecencyList<T> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, value: T) -> NodeHandle {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        NodeHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        self.resolve(handle)
            .and_then(|index| self.slots[index].node.as_ref())
            .map(|node| &node.value)
    }

    pub fn front(&self) -> Option<(NodeHandle, &T)> {
        let index = self.head?;
        let slot = &self.slots[index];
        slot.node.as_ref().map(|node| {
            (
                NodeHandle {
                    index,
                    generation: slot.generation,
                },
                &node.value,
            )
        })
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let (handle, _) = self.front()?;
        self.remove(handle)
    }

    /// Returns `None` if the handle is stale.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        let index = self.resolve(handle)?;
        self.unlink(index);
        let slot = &mut self.slots[index];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(node.value)
    }

    /// Returns `false` if the handle is stale.
    pub fn move_to_back(&mut self, handle: NodeHandle) -> bool {
        let Some(index) = self.resolve(handle) else {
            return false;
        };
        if self.tail == Some(index) {
            return true;
        }
        self.unlink(index);
        let tail = self.tail;
        {
            let node = self.node_mut(index);
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        trace!(index, "moved to most recently used");
        true
    }

    /// Iterates from least to most recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn resolve(&self, handle: NodeHandle) -> Option<usize> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation == handle.generation && slot.node.is_some() {
            Some(handle.index)
        } else {
            None
        }
    }

    // index must refer to an occupied slot
    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match self.slots[index].node.as_mut() {
            Some(node) => node,
            None => unreachable!("linked index points at an empty slot"),
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node_mut(index);
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a RecencyList<T>,
    cursor: Option<usize>,
}
impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.slots[index].node.as_ref()?;
        self.cursor = node.next;
        Some(&node.value)
    }
}

use crate::core::{CompoundEvent, Quadruple};
use crate::pubsub::subscription::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemClass {
    Quadruple,
    Subscription,
    CompoundEvent,
}

impl ItemClass {
    fn index(self) -> usize {
        match self {
            ItemClass::Quadruple => 0,
            ItemClass::Subscription => 1,
            ItemClass::CompoundEvent => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferedItem {
    Quadruple(Quadruple),
    Subscription(Subscription),
    /// An event received because its `indexed`-th quadruple belongs here
    CompoundEvent { event: CompoundEvent, indexed: usize },
}

impl BufferedItem {
    pub fn class(&self) -> ItemClass {
        match self {
            BufferedItem::Quadruple(_) => ItemClass::Quadruple,
            BufferedItem::Subscription(_) => ItemClass::Subscription,
            BufferedItem::CompoundEvent { .. } => ItemClass::CompoundEvent,
        }
    }

    /// The fact this item stores on the peer, if any.
    pub fn stored_quadruple(&self) -> Option<&Quadruple> {
        match self {
            BufferedItem::Quadruple(quadruple) => Some(quadruple),
            BufferedItem::CompoundEvent { event, indexed } => event.quadruples().get(*indexed),
            BufferedItem::Subscription(_) => None,
        }
    }
}

/// Items waiting for a flush, in arrival order.
#[derive(Debug, Default)]
pub struct Buffer {
    items: Vec<BufferedItem>,
    counts: [usize; 3],
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: BufferedItem) {
        self.counts[item.class().index()] += 1;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count(&self, class: ItemClass) -> usize {
        self.counts[class.index()]
    }

    pub fn items(&self) -> &[BufferedItem] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BufferedItem)> {
        self.items.iter().enumerate()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (usize, &Subscription)> {
        self.iter().filter_map(|(position, item)| match item {
            BufferedItem::Subscription(subscription) => Some((position, subscription)),
            _ => None,
        })
    }

    /// Facts stored by this buffer with their positions.
    pub fn stored_quadruples(&self) -> impl Iterator<Item = (usize, &Quadruple)> {
        self.iter().filter_map(|(position, item)| item.stored_quadruple().map(|q| (position, q)))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.counts = [0; 3];
    }
}

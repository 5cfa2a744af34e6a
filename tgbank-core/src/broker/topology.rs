use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Everything a client has declared, in declaration order.
///
/// Replayed after a reconnect so the broker side always matches what the
/// application expects, even after a broker restart that lost transient
/// entities.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<Exchange>,
    queues: Vec<Queue>,
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn record_exchange(&mut self, exchange: Exchange) {
        if let Some(existing) = self.exchanges.iter_mut().find(|e| e.name == exchange.name) {
            *existing = exchange;
        } else {
            self.exchanges.push(exchange);
        }
    }

    pub fn record_queue(&mut self, queue: Queue) {
        if let Some(existing) = self.queues.iter_mut().find(|q| q.name == queue.name) {
            *existing = queue;
        } else {
            self.queues.push(queue);
        }
    }

    pub fn record_binding(&mut self, binding: Binding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_deduplicates() {
        let mut topology = Topology::default();
        let queue = Queue {
            name: "charge_deposit_queue".to_string(),
            durable: true,
        };
        let binding = Binding {
            queue: queue.name.clone(),
            exchange: "charge".to_string(),
            routing_key: "charge.deposit".to_string(),
        };

        topology.record_queue(queue.clone());
        topology.record_queue(queue);
        topology.record_binding(binding.clone());
        topology.record_binding(binding);

        assert_eq!(topology.queues().len(), 1);
        assert_eq!(topology.bindings().len(), 1);
        assert!(topology.exchanges().is_empty());
    }
}

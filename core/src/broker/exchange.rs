//! Exchanges and their queue bindings.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::topic_matcher::TopicMatcher;
use crate::ValidationError;

pub const DEFAULT_EXCHANGE: &str = "";
pub const DIRECT_EXCHANGE: &str = "amq.direct";
pub const TOPIC_EXCHANGE: &str = "amq.topic";
/// Exchange dead lettered messages are republished through
pub const DEAD_LETTER_EXCHANGE: &str = "amq.dlx";

const BUILT_IN: [&str; 4] = [
    DEFAULT_EXCHANGE,
    DIRECT_EXCHANGE,
    TOPIC_EXCHANGE,
    DEAD_LETTER_EXCHANGE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Topic,
}

impl FromStr for ExchangeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            other => Err(ValidationError::command_invalid(format!(
                "Unknown exchange type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Topic => f.write_str("topic"),
        }
    }
}

#[derive(Debug)]
pub struct Exchange {
    name: String,
    exchange_type: ExchangeType,
    durable: bool,
    /// routing key or pattern -> bound queues
    bindings: HashMap<String, BTreeSet<String>>,
    /// only used by topic exchanges
    patterns: TopicMatcher,
}

impl Exchange {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType, durable: bool) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            durable,
            bindings: HashMap::new(),
            patterns: TopicMatcher::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_unused(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.values().map(BTreeSet::len).sum()
    }

    pub fn bind(&mut self, queue: &str, routing_key: &str) {
        let queues = self.bindings.entry(routing_key.to_string()).or_default();
        if queues.is_empty() && self.exchange_type == ExchangeType::Topic {
            self.patterns.add(routing_key);
        }
        if queues.insert(queue.to_string()) {
            debug!(exchange = %self.name, queue, routing_key, "Binding added");
        }
    }

    /// Returns false when no such binding existed.
    pub fn unbind(&mut self, queue: &str, routing_key: &str) -> bool {
        let Some(queues) = self.bindings.get_mut(routing_key) else {
            return false;
        };
        let removed = queues.remove(queue);
        if queues.is_empty() {
            self.bindings.remove(routing_key);
            if self.exchange_type == ExchangeType::Topic {
                self.patterns.remove(routing_key);
            }
        }
        removed
    }

    /// Drop every binding of a queue
    pub fn unbind_queue(&mut self, queue: &str) {
        let keys = self
            .bindings
            .iter()
            .filter(|(_, queues)| queues.contains(queue))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in keys {
            self.unbind(queue, &key);
        }
    }

    /// Queues a message with `routing_key` goes to, without duplicates
    pub fn route(&self, routing_key: &str) -> BTreeSet<String> {
        match self.exchange_type {
            ExchangeType::Direct => self.bindings.get(routing_key).cloned().unwrap_or_default(),
            ExchangeType::Topic => {
                let mut queues = BTreeSet::new();
                self.patterns.matching_bindings(routing_key, |pattern| {
                    if let Some(bound) = self.bindings.get(pattern) {
                        queues.extend(bound.iter().cloned());
                    }
                });
                queues
            }
        }
    }
}

/// Every declared exchange by name
#[derive(Debug)]
pub struct ExchangeRegistry {
    exchanges: HashMap<String, Exchange>,
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeRegistry {
    /// Registry holding the built-in exchanges
    pub fn new() -> Self {
        let mut exchanges = HashMap::new();
        for (name, exchange_type) in [
            (DEFAULT_EXCHANGE, ExchangeType::Direct),
            (DIRECT_EXCHANGE, ExchangeType::Direct),
            (TOPIC_EXCHANGE, ExchangeType::Topic),
            (DEAD_LETTER_EXCHANGE, ExchangeType::Direct),
        ] {
            exchanges.insert(name.to_string(), Exchange::new(name, exchange_type, true));
        }
        Self { exchanges }
    }

    pub fn get(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Exchange> {
        self.exchanges.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn declare(
        &mut self,
        name: &str,
        exchange_type: &str,
        passive: bool,
        durable: bool,
    ) -> Result<(), ValidationError> {
        if let Some(existing) = self.exchanges.get(name) {
            if !passive && existing.exchange_type.to_string() != exchange_type {
                return Err(ValidationError::not_allowed(format!(
                    "Exchange type [{}] does not match the existing one [{}].",
                    exchange_type, existing.exchange_type
                )));
            }
            return Ok(());
        }
        if passive {
            return Err(ValidationError::not_found(format!(
                "Exchange [ {} ] doesn't exists. Passive parameter is set, hence not creating the exchange.",
                name
            )));
        }
        if name.starts_with("amq.") {
            return Err(ValidationError::access_refused(format!(
                "Exchange names starting with 'amq.' are reserved: {}",
                name
            )));
        }

        let exchange_type = exchange_type.parse::<ExchangeType>()?;
        self.exchanges
            .insert(name.to_string(), Exchange::new(name, exchange_type, durable));
        info!(exchange = name, %exchange_type, durable, "Exchange declared");
        Ok(())
    }

    pub fn delete(&mut self, name: &str, if_unused: bool) -> Result<(), ValidationError> {
        if BUILT_IN.contains(&name) {
            return Err(ValidationError::access_refused(format!(
                "Cannot delete built in exchange {}",
                name
            )));
        }
        let Some(exchange) = self.exchanges.get(name) else {
            return Err(ValidationError::not_found(format!(
                "Exchange [ {} ] not found",
                name
            )));
        };
        if if_unused && !exchange.is_unused() {
            return Err(ValidationError::precondition_failed(format!(
                "Cannot delete exchange {}. It has {} binding(s).",
                name,
                exchange.binding_count()
            )));
        }
        self.exchanges.remove(name);
        info!(exchange = name, "Exchange deleted");
        Ok(())
    }

    /// Remove a deleted queue from every exchange
    pub fn remove_queue(&mut self, queue: &str) {
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(queue);
        }
    }
}

//! Interceptor driven by configuration

use super::StreamInterceptor;
use crate::config::{Config, RuleScope};
use crate::error::Result;
use crate::modifier::{
    HttpStreamOperator, NetworkStreamModifier, PassThrough, StreamReplacementOperator,
};
use crate::stream::{pipe, NetworkStream};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One stage of the modifier chain
#[derive(Debug, Clone)]
pub enum Operator {
    /// Relay unchanged
    PassThrough,
    /// HTTP-aware rewriting
    Http(HttpStreamOperator),
    /// Raw byte replacement
    Replace(StreamReplacementOperator),
}

impl Operator {
    fn name(&self) -> &'static str {
        match self {
            Operator::PassThrough => "pass",
            Operator::Http(_) => "http",
            Operator::Replace(_) => "replace",
        }
    }

    fn build(
        &self,
        name: String,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
    ) -> NetworkStreamModifier {
        match self {
            Operator::PassThrough => {
                NetworkStreamModifier::new(name, alice, bob, PassThrough, PassThrough)
            }
            Operator::Http(op) => op.clone().into_modifier(name, alice, bob),
            Operator::Replace(op) => op.clone().into_modifier(name, alice, bob),
        }
    }
}

/// Intercepts flows by server port and chains a fixed list of operators
///
/// With no operators a single pass-through modifier is used.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredInterceptor {
    ports: HashSet<u16>,
    excluded: HashSet<Ipv4Addr>,
    operators: Vec<Operator>,
}

impl ConfiguredInterceptor {
    /// Intercept every port, relay unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a validated configuration
    ///
    /// The HTTP operator comes first so raw replacement sees re-encoded messages.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut interceptor = Self::new()
            .with_ports(config.interception.ports.iter().copied())
            .with_excluded(config.interception.exclude_addresses.iter().copied());
        if config.http.enabled {
            let operator = HttpStreamOperator::new(config.http_options()?);
            interceptor = interceptor.with_operator(Operator::Http(operator));
        }
        let rules = config.replacement_rules(RuleScope::Stream)?;
        if !rules.is_empty() {
            let operator = StreamReplacementOperator::new(rules);
            interceptor = interceptor.with_operator(Operator::Replace(operator));
        }
        Ok(interceptor)
    }

    /// Restrict interception to these server ports
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports.extend(ports);
        self
    }

    /// Never intercept flows touching these addresses
    pub fn with_excluded(mut self, addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.excluded.extend(addresses);
        self
    }

    /// Append an operator to the chain
    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operators.push(operator);
        self
    }

    /// Operators from the client end to the server end
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }
}

impl StreamInterceptor for ConfiguredInterceptor {
    fn should_intercept(&self, src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> bool {
        if self.excluded.contains(&src) || self.excluded.contains(&dst) {
            return false;
        }
        self.ports.is_empty() || self.ports.contains(&dst_port) || self.ports.contains(&src_port)
    }

    fn create_and_link_stream_operators(
        &self,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
    ) -> Result<Vec<NetworkStreamModifier>> {
        let default_chain = [Operator::PassThrough];
        let operators: &[Operator] = if self.operators.is_empty() {
            &default_chain
        } else {
            &self.operators
        };

        let mut modifiers = Vec::with_capacity(operators.len());
        let mut left = alice;
        for (index, operator) in operators.iter().enumerate() {
            let name = format!("{}-{index}", operator.name());
            if index + 1 == operators.len() {
                modifiers.push(operator.build(name, left, bob.clone()));
                break;
            }
            let (right, next_left) = pipe();
            modifiers.push(operator.build(name, left, Arc::new(right)));
            left = Arc::new(next_left);
        }
        Ok(modifiers)
    }
}

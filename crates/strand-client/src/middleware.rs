//! Invocation middleware applied to every consumer-facing operation.
//!
//! # Purpose
//! Lets callers observe parameters, inject behavior around the transport,
//! time invocations, or short-circuit by returning a value without calling
//! `next`, uniformly for calls, subscribes, and unsubscribes.
//!
//! # Design notes
//! The chain is a recursive `Next` delegation: each middleware receives the
//! remaining chain and decides whether to continue. The terminal step is
//! the actual transport operation supplied by the client core.
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use strand_common::ClientId;

use crate::error::Result;

/// Discriminates what kind of operation is passing through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationType {
    Call,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub client_id: ClientId,
    pub item: String,
    pub invocation_type: InvocationType,
}

pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        parameters: Vec<Value>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Value>>;
}

pub(crate) type Terminal<'a> =
    Box<dyn FnOnce(Vec<Value>) -> BoxFuture<'a, Result<Value>> + Send + 'a>;

/// The remainder of the chain, ending in the transport operation.
pub struct Next<'a> {
    ctx: &'a InvocationContext,
    chain: &'a [Arc<dyn Middleware>],
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    pub fn run(self, parameters: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(
                self.ctx,
                parameters,
                Next {
                    ctx: self.ctx,
                    chain: rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(parameters),
        }
    }
}

pub(crate) fn with_middlewares<'a>(
    ctx: &'a InvocationContext,
    chain: &'a [Arc<dyn Middleware>],
    parameters: Vec<Value>,
    terminal: Terminal<'a>,
) -> BoxFuture<'a, Result<Value>> {
    Next {
        ctx,
        chain,
        terminal,
    }
    .run(parameters)
}

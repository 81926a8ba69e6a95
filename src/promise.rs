// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-shot promises resolved by correlated responses.
//!
//! A [`Promise`] settles at most once. Continuations registered with `then`
//! and `catch` never run inside the resolver; they are parked on the shared
//! [`CallbackQueue`] and fire when the owning endpoint next drains it, which
//! keeps user callbacks out of the middle of socket pumping.

use crate::messages::ResponseBody;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A promise carrying a worker response.
pub type ResponsePromise = Promise<ResponseBody>;

/// Deferred continuations, drained at one well-defined point per pump.
#[derive(Clone)]
pub struct CallbackQueue {
    inner: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        CallbackQueue { inner: Rc::new(RefCell::new(VecDeque::new())) }
    }

    pub fn push(&self, callback: Box<dyn FnOnce()>) {
        self.inner.borrow_mut().push_back(callback);
    }

    /// Runs queued continuations in registration order. Continuations queued
    /// while draining run in the same drain.
    pub fn drain(&self) {
        loop {
            let next = self.inner.borrow_mut().pop_front();
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

enum PromiseState<T> {
    Pending,
    Resolved(T),
    Rejected(String),
}

struct PromiseInner<T> {
    state: PromiseState<T>,
    then_callbacks: Vec<Box<dyn FnOnce(T)>>,
    catch_callbacks: Vec<Box<dyn FnOnce(String)>>,
    queue: CallbackQueue,
}

/// A single-fire future with `then`/`catch` continuation lists.
pub struct Promise<T: Clone + 'static> {
    inner: Rc<RefCell<PromiseInner<T>>>,
}

impl<T: Clone + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { inner: self.inner.clone() }
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub fn new(queue: &CallbackQueue) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(PromiseInner {
                state: PromiseState::Pending,
                then_callbacks: Vec::new(),
                catch_callbacks: Vec::new(),
                queue: queue.clone(),
            })),
        }
    }

    /// A promise already resolved with `value`. Continuations still fire
    /// through the queue, not inline.
    pub fn resolved(queue: &CallbackQueue, value: T) -> Self {
        let promise = Promise::new(queue);
        promise.resolve(value);
        promise
    }

    /// Settles the promise with a value. A no-op if already settled.
    pub fn resolve(&self, value: T) {
        let (callbacks, queue) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Resolved(value.clone());
            inner.catch_callbacks.clear();
            (std::mem::take(&mut inner.then_callbacks), inner.queue.clone())
        };
        for callback in callbacks {
            let value = value.clone();
            queue.push(Box::new(move || callback(value)));
        }
    }

    /// Settles the promise with an error. A no-op if already settled.
    pub fn reject(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let (callbacks, queue) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Rejected(reason.clone());
            inner.then_callbacks.clear();
            (std::mem::take(&mut inner.catch_callbacks), inner.queue.clone())
        };
        for callback in callbacks {
            let reason = reason.clone();
            queue.push(Box::new(move || callback(reason)));
        }
    }

    /// Registers a continuation for the resolved value. When the promise is
    /// already resolved the continuation is queued for the next drain.
    pub fn then(&self, callback: impl FnOnce(T) + 'static) {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            PromiseState::Pending => inner.then_callbacks.push(Box::new(callback)),
            PromiseState::Resolved(value) => {
                let value = value.clone();
                inner.queue.push(Box::new(move || callback(value)));
            }
            PromiseState::Rejected(_) => {}
        }
    }

    /// Registers a continuation for the rejection reason.
    pub fn catch(&self, callback: impl FnOnce(String) + 'static) {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            PromiseState::Pending => inner.catch_callbacks.push(Box::new(callback)),
            PromiseState::Rejected(reason) => {
                let reason = reason.clone();
                inner.queue.push(Box::new(move || callback(reason)));
            }
            PromiseState::Resolved(_) => {}
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, PromiseState::Pending)
    }

    /// The resolved value, when the promise has resolved.
    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().state {
            PromiseState::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }
}

//! A small tagged sync/async callable type.
//!
//! The runtime accepts hooks, predicates, and handlers that are either plain
//! synchronous functions or `async fn`s. Rather than re-inspect a callable on
//! every invocation, each registration picks a variant once; the dispatcher
//! then knows statically whether to offload to a blocking thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callable taking `In` and producing `Out`, tagged by whether the
/// underlying function is synchronous or asynchronous.
pub enum Callable<In, Out> {
    Sync(Arc<dyn Fn(In) -> Out + Send + Sync>),
    Async(Arc<dyn Fn(In) -> BoxFuture<'static, Out> + Send + Sync>),
}

impl<In, Out> Clone for Callable<In, Out> {
    fn clone(&self) -> Self {
        match self {
            Callable::Sync(f) => Callable::Sync(f.clone()),
            Callable::Async(f) => Callable::Async(f.clone()),
        }
    }
}

impl<In, Out> Callable<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(In) -> Out + Send + Sync + 'static,
    {
        Callable::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Out> + Send + 'static,
    {
        Callable::Async(Arc::new(move |input| Box::pin(f(input))))
    }

    /// Invoke the callable, offloading synchronous callbacks onto a worker
    /// thread so a blocking implementation cannot stall the async runtime.
    /// Used for hooks and handlers.
    pub async fn invoke_offloaded(&self, input: In) -> Out {
        match self {
            Callable::Sync(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(input))
                    .await
                    .expect("synchronous callable panicked")
            }
            Callable::Async(f) => f(input).await,
        }
    }

    /// Invoke the callable inline, without a thread offload. Used for
    /// predicates and middleware, which are expected to be cheap.
    pub async fn invoke_inline(&self, input: In) -> Out {
        match self {
            Callable::Sync(f) => f(input),
            Callable::Async(f) => f(input).await,
        }
    }

    /// Identity of the underlying `Arc`, stable across clones of the same
    /// registration. Used to dedup a callable in a set without requiring
    /// `Eq`/`Hash` on arbitrary closures.
    pub fn ptr_id(&self) -> usize {
        match self {
            Callable::Sync(f) => Arc::as_ptr(f) as *const () as usize,
            Callable::Async(f) => Arc::as_ptr(f) as *const () as usize,
        }
    }
}

impl<In, T> Callable<In, Result<T, anyhow::Error>>
where
    In: Send + 'static,
    T: Send + 'static,
{
    /// Like [`Self::invoke_offloaded`], but for fallible callables: a panic
    /// inside a synchronous callable offloaded to `spawn_blocking` surfaces
    /// as an `Err` rather than propagating the panic, so one misbehaving
    /// handler cannot take down the dispatcher.
    pub async fn invoke_offloaded_fallible(&self, input: In) -> Result<T, anyhow::Error> {
        match self {
            Callable::Sync(f) => {
                let f = f.clone();
                match tokio::task::spawn_blocking(move || f(input)).await {
                    Ok(result) => result,
                    Err(join_err) => Err(anyhow::anyhow!("handler panicked: {join_err}")),
                }
            }
            Callable::Async(f) => f(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_callable_offloaded_runs() {
        let c: Callable<i32, i32> = Callable::sync(|x| x + 1);
        assert_eq!(c.invoke_offloaded(41).await, 42);
    }

    #[tokio::test]
    async fn async_callable_inline_runs() {
        let c: Callable<i32, i32> = Callable::from_async(|x| async move { x * 2 });
        assert_eq!(c.invoke_inline(21).await, 42);
    }
}

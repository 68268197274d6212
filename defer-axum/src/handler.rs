//! Task handler functions and their type-erased form.
//!
//! A handler is any async function shaped like one of:
//!
//! ```text
//! async fn()                              -> anyhow::Result<O>
//! async fn(I)                             -> anyhow::Result<O>
//! async fn(DeliveryContext, I)            -> anyhow::Result<O>
//! ```
//!
//! where `I` is the deserialized payload and `O: Serialize` becomes the
//! JSON response body. The marker type `T` only exists to keep the three
//! impls apart.

use std::future::Future;
use std::sync::Arc;

use defer_core::delivery::DeliveryContext;
use defer_core::errors::TaskError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

pub trait TaskHandler<T, I>: Clone + Send + Sync + 'static {
    type Output: Serialize + Send + 'static;

    fn call(&self, ctx: DeliveryContext, input: I) -> BoxFuture<'static, anyhow::Result<Self::Output>>;
}

impl<F, Fut, O> TaskHandler<(), ()> for F
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Output = O;

    fn call(&self, _ctx: DeliveryContext, _input: ()) -> BoxFuture<'static, anyhow::Result<O>> {
        (self)().boxed()
    }
}

impl<F, Fut, I, O> TaskHandler<(I,), I> for F
where
    F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    I: Send + 'static,
    O: Serialize + Send + 'static,
{
    type Output = O;

    fn call(&self, _ctx: DeliveryContext, input: I) -> BoxFuture<'static, anyhow::Result<O>> {
        (self)(input).boxed()
    }
}

impl<F, Fut, I, O> TaskHandler<(DeliveryContext, I), I> for F
where
    F: Fn(DeliveryContext, I) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    I: Send + 'static,
    O: Serialize + Send + 'static,
{
    type Output = O;

    fn call(&self, ctx: DeliveryContext, input: I) -> BoxFuture<'static, anyhow::Result<O>> {
        (self)(ctx, input).boxed()
    }
}

pub(crate) type ErasedHandler<I> =
    Arc<dyn Fn(DeliveryContext, I) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub(crate) fn erase<T, I, H>(handler: H) -> ErasedHandler<I>
where
    H: TaskHandler<T, I>,
    I: Send + 'static,
{
    Arc::new(move |ctx, input| {
        let fut = handler.call(ctx, input);
        async move {
            let output = fut.await?;
            serde_json::to_value(output).map_err(|e| {
                TaskError::handler(format!("handler output could not be serialized: {e}"))
                    .into_anyhow()
            })
        }
        .boxed()
    })
}

use super::{
    errors::TaskError,
    result::Outcome,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::{
    any::Any,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
};


/// One unit of work: turn a task descriptor into a handle or fail.
///
/// Implementations should not retry; a single failure is terminal for the task
/// within its run.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    type Task: Send + Sync + 'static;
    type Handle: Clone + Send + Sync + 'static;

    async fn execute(&self, task: &Self::Task) -> Result<Self::Handle, TaskError>;
}


/// Adapts an async closure into a [`TaskExecutor`]. See [`executor_fn`].
pub struct FnExecutor<F, T, H> {
    f: F,
    _marker: PhantomData<fn(T) -> H>,
}

pub fn executor_fn<F, Fut, T, H>(f: F) -> FnExecutor<F, T, H>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<H, TaskError>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    H: Clone + Send + Sync + 'static,
{
    FnExecutor {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T, H> TaskExecutor for FnExecutor<F, T, H>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<H, TaskError>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    H: Clone + Send + Sync + 'static,
{
    type Task = T;
    type Handle = H;

    async fn execute(&self, task: &T) -> Result<H, TaskError> {
        (self.f)(task.clone()).await
    }
}


/// Runs one task, folding errors and panics into [`Outcome::Failed`].
pub(crate) async fn execute_guarded<E: TaskExecutor>(
    executor: &E,
    task: &E::Task,
) -> Outcome<E::Handle> {
    // `execute` itself may panic before handing back a future
    match AssertUnwindSafe(async { executor.execute(task).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(handle)) => Outcome::Success(handle),
        Ok(Err(err)) => {
            tracing::debug!(%err, "task failed");
            Outcome::Failed
        }
        Err(payload) => {
            let err = TaskError::Panic(panic_message(payload.as_ref()));
            tracing::warn!(%err, "task panicked");
            Outcome::Failed
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".into()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guarded_execution_maps_every_ending() {
        let executor = executor_fn(|n: u32| async move {
            match n {
                0 => Err(TaskError::Rejected("zero".into())),
                1 => panic!("boom"),
                n => Ok(n * 2),
            }
        });

        assert_eq!(execute_guarded(&executor, &0).await, Outcome::Failed);
        assert_eq!(execute_guarded(&executor, &1).await, Outcome::Failed);
        assert_eq!(execute_guarded(&executor, &21).await, Outcome::Success(42));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}

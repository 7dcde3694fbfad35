use std::{future::Future, marker::PhantomData, sync::Arc};

use typed_builder::TypedBuilder;

use crate::{aggregate::Aggregate, metric::IterationContext};

/// What to run on every arrival, and where its metrics go.
///
/// `action` is called once per dispatched iteration with that iteration's
/// [`IterationContext`]; the metric it resolves to is consumed into `metrics`,
/// which every worker shares.
#[derive(TypedBuilder)]
pub struct Scenario<A, F, Fut>
where
    A: Aggregate,
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = A::Metric> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    pub metrics: Arc<A>,
    #[builder(default, setter(skip))]
    future: PhantomData<fn() -> Fut>,
}

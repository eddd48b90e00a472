// Staged pipeline runner
//
// A pipeline is (producer, [transforms...], consumer) joined by bounded
// channels. Each stage runs as its own tokio task:
//
//   Producer -> Channel -> Transform -> Channel -> ... -> Consumer
//
// When a stage returns Ok, its downstream channel is closed so the next
// stage drains the buffered values and finishes normally. When a stage
// returns Err, its downstream channel is poisoned and its upstream channel
// is closed; the error is reported after every stage of every pipeline has
// settled.

use crate::channel::Channel;
use crate::errors::PipelineError;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Capacity of the bounded channels between pipeline stages.
pub const STAGE_CAPACITY: usize = 30;

#[async_trait]
pub trait Producer<T: Send>: Send {
    /// Push values into `out` until the source is exhausted. A false return
    /// from `out.push` means downstream finished first; stop with Ok.
    async fn produce(&mut self, out: Arc<Channel<T>>) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait Transform<T: Send>: Send {
    async fn process(
        &mut self,
        input: Arc<Channel<T>>,
        out: Arc<Channel<T>>,
    ) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait Consumer<T: Send>: Send {
    async fn consume(&mut self, input: Arc<Channel<T>>) -> Result<(), PipelineError>;
}

/// One producer, any number of transforms, one consumer.
pub struct Pipeline<T: Send> {
    pub producer: Box<dyn Producer<T>>,
    pub transforms: Vec<Box<dyn Transform<T>>>,
    pub consumer: Box<dyn Consumer<T>>,
}

impl<T: Send> Pipeline<T> {
    pub fn new(producer: Box<dyn Producer<T>>, consumer: Box<dyn Consumer<T>>) -> Self {
        Self {
            producer,
            transforms: Vec::new(),
            consumer,
        }
    }

    pub fn with_transforms(
        producer: Box<dyn Producer<T>>,
        transforms: Vec<Box<dyn Transform<T>>>,
        consumer: Box<dyn Consumer<T>>,
    ) -> Self {
        Self {
            producer,
            transforms,
            consumer,
        }
    }
}

/// Run one pipeline to completion. Returns the first stage error, if any.
pub async fn run_pipeline<T: Send + 'static>(pipeline: Pipeline<T>) -> Result<(), PipelineError> {
    let Pipeline {
        mut producer,
        transforms,
        mut consumer,
    } = pipeline;

    let stage_count = transforms.len() + 2;
    let mut channels = Vec::with_capacity(stage_count - 1);
    for _ in 0..stage_count - 1 {
        channels.push(Arc::new(Channel::<T>::bounded(STAGE_CAPACITY)));
    }

    let mut tasks = Vec::with_capacity(stage_count);

    {
        let out = Arc::clone(&channels[0]);
        tasks.push(tokio::spawn(async move {
            let result = producer.produce(Arc::clone(&out)).await;
            finish_stage(&result, None, Some(&out));
            result
        }));
    }

    for (index, mut transform) in transforms.into_iter().enumerate() {
        let input = Arc::clone(&channels[index]);
        let out = Arc::clone(&channels[index + 1]);
        tasks.push(tokio::spawn(async move {
            let result = transform.process(Arc::clone(&input), Arc::clone(&out)).await;
            finish_stage(&result, Some(&input), Some(&out));
            result
        }));
    }

    {
        let input = Arc::clone(&channels[stage_count - 2]);
        tasks.push(tokio::spawn(async move {
            let result = consumer.consume(Arc::clone(&input)).await;
            finish_stage(&result, Some(&input), None);
            result
        }));
    }

    let mut first_error = None;
    for task in join_all(tasks).await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("pipeline stage failed: {}", err);
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                tracing::error!("pipeline stage panicked: {}", join_err);
                first_error.get_or_insert(PipelineError::invariant(format!(
                    "stage panicked: {join_err}"
                )));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn finish_stage<T>(
    result: &Result<(), PipelineError>,
    input: Option<&Arc<Channel<T>>>,
    out: Option<&Arc<Channel<T>>>,
) {
    match result {
        Ok(()) => {
            if let Some(out) = out {
                out.close();
            }
        }
        Err(_) => {
            if let Some(out) = out {
                out.poison();
            }
            if let Some(input) = input {
                input.close();
            }
        }
    }
}

/// Run several pipelines concurrently. All pipelines run to completion even
/// if one fails; the first error is returned afterwards.
pub async fn run_pipelines<T: Send + 'static>(
    pipelines: Vec<Pipeline<T>>,
) -> Result<(), PipelineError> {
    let mut first_error = None;
    for result in join_all(pipelines.into_iter().map(run_pipeline)).await {
        if let Err(err) = result {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

//! Running chains of blocks: extractor, mappers, loader.
//!
//! Blocks are started head to tail with each producer's stdout handed to the
//! next block as its stdin, so protocol data never passes through this
//! process. What does pass through is every block's stderr and the loader's
//! stdout, which are proxied line by line to tracing and to a
//! [`StateCapture`].

pub mod parser;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use elflow_types::state::StateMap;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::block::sink::proxy_lines;
use crate::block::{
    BlockError, BlockRole, BlockSpec, InvocationContext, LineSink, OutputStream, PluginInvoker,
    StateCapture, SubprocessBlock, TracingSink, GRACEFUL_STOP_TIMEOUT,
};
use crate::signals::Shutdown;

pub use parser::{BlockParser, BlockSet, ExtractLoadSet, ParseError, StateIdOptions};

/// How long to wait for output proxies to drain after all blocks exited.
const PROXY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful extract-load run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElOutcome {
    /// `value` of the last STATE message the loader emitted.
    pub captured_state: Option<StateMap>,
}

/// Validated extractor → mappers → loader chain.
pub struct ExtractLoadBlocks {
    blocks: Vec<BlockSpec>,
    invoker: Arc<dyn PluginInvoker>,
    context: InvocationContext,
    capture: StateCapture,
    grace: Duration,
}

impl ExtractLoadBlocks {
    /// # Errors
    ///
    /// Returns [`BlockError::InvalidBlockSet`] unless the chain is one
    /// extractor, any number of mappers, and one loader, in that order.
    pub fn new(blocks: Vec<BlockSpec>, invoker: Arc<dyn PluginInvoker>) -> Result<Self, BlockError> {
        validate_chain(&blocks)?;
        Ok(Self {
            blocks,
            invoker,
            context: InvocationContext::default(),
            capture: StateCapture::new(),
            grace: GRACEFUL_STOP_TIMEOUT,
        })
    }

    /// Bookmarks handed to the extractor.
    #[must_use]
    pub fn with_incoming_state(mut self, state: Option<StateMap>) -> Self {
        self.context.incoming_state = state;
        self
    }

    /// Variables applied to every block after its own environment.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.context.env = env;
        self
    }

    /// SIGTERM grace period used when stopping blocks.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockSpec] {
        &self.blocks
    }

    /// Last state captured so far, also available after a failed run.
    #[must_use]
    pub fn captured_state(&self) -> Option<StateMap> {
        self.capture.latest()
    }

    /// Run the chain to completion.
    ///
    /// The first non-zero exit force-stops the remaining blocks and fails
    /// the run with [`BlockError::BlockFailed`]. Cancellation stops every
    /// block and fails with [`BlockError::Cancelled`].
    ///
    /// # Errors
    ///
    /// See above; also any start-up failure of a block.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<ElOutcome, BlockError> {
        run_chain(
            &self.blocks,
            self.invoker.as_ref(),
            &self.context,
            Some(&self.capture),
            shutdown,
            self.grace,
        )
        .await?;
        Ok(ElOutcome {
            captured_state: self.capture.latest(),
        })
    }
}

/// Run a standalone utility block, proxying its output to tracing.
///
/// # Errors
///
/// Same failure modes as [`ExtractLoadBlocks::run`].
pub async fn run_utility(
    spec: &BlockSpec,
    invoker: &dyn PluginInvoker,
    shutdown: &Shutdown,
) -> Result<(), BlockError> {
    run_chain(
        std::slice::from_ref(spec),
        invoker,
        &InvocationContext::default(),
        None,
        shutdown,
        GRACEFUL_STOP_TIMEOUT,
    )
    .await
}

fn validate_chain(blocks: &[BlockSpec]) -> Result<(), BlockError> {
    let invalid = |msg: String| Err(BlockError::InvalidBlockSet(msg));
    let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
        return invalid("no blocks".into());
    };
    if blocks.len() < 2 {
        return invalid("an extract-load set needs at least an extractor and a loader".into());
    }
    if first.role() != BlockRole::Extractor {
        return invalid(format!(
            "first block '{}' must be an extractor, found {}",
            first.name(),
            first.role()
        ));
    }
    if last.role() != BlockRole::Loader {
        return invalid(format!(
            "last block '{}' must be a loader, found {}",
            last.name(),
            last.role()
        ));
    }
    for block in &blocks[1..blocks.len() - 1] {
        if block.role() != BlockRole::Mapper {
            return invalid(format!(
                "intermediate block '{}' must be a mapper, found {}",
                block.name(),
                block.role()
            ));
        }
    }
    Ok(())
}

/// Stop request sent to a block supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Graceful,
    Force,
}

/// Start every block, supervise them until all have exited, then drain output.
async fn run_chain(
    specs: &[BlockSpec],
    invoker: &dyn PluginInvoker,
    context: &InvocationContext,
    capture: Option<&StateCapture>,
    shutdown: &Shutdown,
    grace: Duration,
) -> Result<(), BlockError> {
    let mut proxies = JoinSet::new();
    let started = start_blocks(specs, invoker, context, capture, grace, &mut proxies).await;
    let blocks = match started {
        Ok(blocks) => blocks,
        Err(e) => {
            proxies.abort_all();
            return Err(e);
        }
    };

    let mut supervisors = JoinSet::new();
    let mut stop_senders = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.into_iter().enumerate() {
        let (tx, rx) = watch::channel(None);
        stop_senders.push(tx);
        supervisors.spawn(supervise(index, block, rx, grace));
    }

    let stop_all = |request: StopRequest| {
        for tx in &stop_senders {
            tx.send_if_modified(|current| {
                if *current == Some(StopRequest::Force) || *current == Some(request) {
                    return false;
                }
                *current = Some(request);
                true
            });
        }
    };

    let mut failure: Option<BlockError> = None;
    let mut cancelled = None;
    let mut forced = false;

    loop {
        tokio::select! {
            joined = supervisors.join_next() => {
                let Some(joined) = joined else { break };
                let (index, result) = joined?;
                let name = specs[index].name();
                let error = match result {
                    Ok(status) if status.success() => {
                        tracing::info!(block = name, "Block finished");
                        None
                    }
                    Ok(status) => Some(BlockError::BlockFailed {
                        block: name.to_string(),
                        code: status.code(),
                    }),
                    Err(e) => Some(e),
                };
                if let Some(error) = error {
                    if failure.is_none() && cancelled.is_none() {
                        tracing::error!(block = name, "{error}; stopping remaining blocks");
                        failure = Some(error);
                        forced = true;
                        stop_all(StopRequest::Force);
                    }
                }
            }
            reason = shutdown.cancelled(), if cancelled.is_none() => {
                tracing::warn!(reason = %reason, forced, "Run cancelled, stopping blocks");
                cancelled = Some(reason);
                stop_all(if forced { StopRequest::Force } else { StopRequest::Graceful });
            }
        }
    }

    drain_proxies(proxies).await;

    if let Some(reason) = cancelled {
        return Err(BlockError::Cancelled(reason));
    }
    failure.map_or(Ok(()), Err)
}

async fn start_blocks(
    specs: &[BlockSpec],
    invoker: &dyn PluginInvoker,
    context: &InvocationContext,
    capture: Option<&StateCapture>,
    grace: Duration,
    proxies: &mut JoinSet<()>,
) -> Result<Vec<SubprocessBlock>, BlockError> {
    let mut blocks: Vec<SubprocessBlock> = Vec::with_capacity(specs.len());
    let mut next_stdin = Stdio::null();

    for (index, spec) in specs.iter().enumerate() {
        let is_last = index + 1 == specs.len();
        let started = invoker
            .prepare(spec, context)
            .map(|invocation| SubprocessBlock::new(spec.clone(), invocation).with_grace_period(grace))
            .and_then(|mut block| {
                block
                    .start(std::mem::replace(&mut next_stdin, Stdio::null()))
                    .map(|()| block)
            });
        let mut block = match started {
            Ok(block) => block,
            Err(e) => {
                for running in &mut blocks {
                    if let Err(stop_err) = running.stop(true).await {
                        tracing::warn!(block = running.name(), "Failed to stop block: {stop_err}");
                    }
                }
                return Err(e);
            }
        };

        if let Some(stderr) = block.take_stderr() {
            let sinks: Vec<Box<dyn LineSink>> = vec![Box::new(TracingSink)];
            let name = block.name().to_string();
            proxies.spawn(proxy_task(name, OutputStream::Stderr, stderr, sinks));
        }
        if let Some(stdout) = block.take_stdout() {
            if is_last {
                let mut sinks: Vec<Box<dyn LineSink>> = vec![Box::new(TracingSink)];
                if let Some(capture) = capture {
                    sinks.push(Box::new(capture.clone()));
                }
                let name = block.name().to_string();
                proxies.spawn(proxy_task(name, OutputStream::Stdout, stdout, sinks));
            } else {
                next_stdin = stdout.try_into().map_err(|source| BlockError::Io {
                    block: block.name().to_string(),
                    source,
                })?;
            }
        }
        blocks.push(block);
    }

    Ok(blocks)
}

async fn proxy_task<R>(block: String, stream: OutputStream, reader: R, mut sinks: Vec<Box<dyn LineSink>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    match proxy_lines(&block, stream, reader, &mut sinks).await {
        Ok(lines) => tracing::debug!(block, stream = stream.as_str(), lines, "Output stream closed"),
        Err(e) => tracing::warn!(block, stream = stream.as_str(), "Failed reading block output: {e}"),
    }
}

async fn drain_proxies(mut proxies: JoinSet<()>) {
    let drained = tokio::time::timeout(PROXY_DRAIN_TIMEOUT, async {
        while proxies.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = proxies.len(),
            "Block output still open after exit, abandoning proxies"
        );
        proxies.abort_all();
    }
}

/// Own one block until it exits, applying stop requests as they arrive.
async fn supervise(
    index: usize,
    mut block: SubprocessBlock,
    mut stop: watch::Receiver<Option<StopRequest>>,
    grace: Duration,
) -> (usize, Result<ExitStatus, BlockError>) {
    let mut kill_deadline: Option<tokio::time::Instant> = None;
    let mut stop_open = true;
    loop {
        tokio::select! {
            status = block.wait() => return (index, status),
            changed = stop.changed(), if stop_open => {
                if changed.is_err() {
                    stop_open = false;
                    continue;
                }
                let request = *stop.borrow_and_update();
                match request {
                    Some(StopRequest::Force) => {
                        block.kill();
                        kill_deadline = None;
                    }
                    Some(StopRequest::Graceful) if kill_deadline.is_none() => {
                        block.terminate();
                        kill_deadline = Some(tokio::time::Instant::now() + grace);
                    }
                    _ => {}
                }
            }
            () = sleep_until(kill_deadline), if kill_deadline.is_some() => {
                tracing::warn!(block = block.name(), "Block ignored SIGTERM, killing");
                block.kill();
                kill_deadline = None;
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExecutableInvoker;
    use crate::config::types::PluginConfig;
    use std::collections::BTreeMap;

    fn spec(name: &str, role: BlockRole) -> BlockSpec {
        BlockSpec::new(PluginConfig {
            name: name.into(),
            role,
            executable: Some("/bin/true".into()),
            args: vec![],
            config: None,
            env: BTreeMap::new(),
        })
    }

    fn chain(roles: &[BlockRole]) -> Result<ExtractLoadBlocks, BlockError> {
        let blocks = roles
            .iter()
            .enumerate()
            .map(|(i, role)| spec(&format!("b{i}"), *role))
            .collect();
        ExtractLoadBlocks::new(blocks, Arc::new(ExecutableInvoker))
    }

    #[test]
    fn accepts_extractor_mappers_loader() {
        use BlockRole::{Extractor, Loader, Mapper};
        assert!(chain(&[Extractor, Loader]).is_ok());
        assert!(chain(&[Extractor, Mapper, Mapper, Loader]).is_ok());
    }

    #[test]
    fn rejects_malformed_chains() {
        use BlockRole::{Extractor, Loader, Mapper, Utility};
        for roles in [
            &[][..],
            &[Extractor][..],
            &[Loader, Extractor][..],
            &[Extractor, Mapper][..],
            &[Extractor, Loader, Loader][..],
            &[Extractor, Utility, Loader][..],
            &[Mapper, Loader][..],
        ] {
            assert!(
                matches!(chain(roles), Err(BlockError::InvalidBlockSet(_))),
                "{roles:?} should be rejected"
            );
        }
    }
}

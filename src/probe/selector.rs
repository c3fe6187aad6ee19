use crate::options::{DEFAULT_SAMPLE_CHANNEL_CAPACITY, TextToolOptions};
use crate::probe::{NativeStatsProbe, ProbeBackend, ProcessProbe, TextToolProbe};
use crate::SystemStatsProvider;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Creates probes, preferring the native backend over the text tool.
#[derive(Clone)]
pub struct ProbeSelector {
    provider: Option<Arc<dyn SystemStatsProvider>>,
    text_tool: TextToolOptions,
    channel_capacity: usize,
}

impl Debug for ProbeSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSelector")
            .field("native", &self.provider.is_some())
            .field("text_tool", &self.text_tool)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl ProbeSelector {
    /// Without a `provider`, every probe uses the text tool.
    pub fn new(provider: Option<Arc<dyn SystemStatsProvider>>, text_tool: TextToolOptions) -> Self {
        Self {
            provider,
            text_tool,
            channel_capacity: DEFAULT_SAMPLE_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    /// A probe for `pid`. Uses the native backend if the provider is ready right now.
    pub fn select(&self, run_id: &str, pid: u32) -> ProcessProbe {
        let backend = match &self.provider {
            Some(provider) if provider.is_ready() => {
                ProbeBackend::Native(NativeStatsProbe::new(Arc::clone(provider)))
            }
            Some(_) => {
                tracing::debug!(run_id, pid, "Native stats provider not ready, using text tool");
                ProbeBackend::TextTool(TextToolProbe::new(self.text_tool.clone()))
            }
            None => ProbeBackend::TextTool(TextToolProbe::new(self.text_tool.clone())),
        };
        ProcessProbe::with_channel_capacity(run_id, pid, backend, self.channel_capacity)
    }
}

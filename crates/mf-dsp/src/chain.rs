//! Ordered plugin chains.

use mf_core::{BufferMut, Result};

use crate::{Plugin, PluginSpecs, ProcessFlags};

/// An ordered list of plugin nodes processed serially in place. Processing
/// order equals insertion order. The chain owns its plugins.
#[derive(Default)]
pub struct DspChain {
    steps: Vec<Box<dyn Plugin>>,
}

impl DspChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, plugin: Box<dyn Plugin>) {
        self.steps.push(plugin);
    }

    pub fn prepend(&mut self, plugin: Box<dyn Plugin>) {
        self.steps.insert(0, plugin);
    }

    pub fn insert(&mut self, index: usize, plugin: Box<dyn Plugin>) {
        self.steps.insert(index.min(self.steps.len()), plugin);
    }

    pub fn remove(&mut self, index: usize) -> Box<dyn Plugin> {
        self.steps.remove(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Plugin> {
        self.steps.get(index).map(|step| step.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Box<dyn Plugin>> {
        self.steps.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.steps.iter().map(|step| step.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Plugin>> {
        self.steps.iter_mut()
    }

    /// Runs every non-bypassed plugin over `buffer` in order. A failing
    /// plugin latches its error on its header and the chain continues, so
    /// one misbehaving plugin doesn't drop the whole track's audio.
    pub fn process(&mut self, buffer: &mut BufferMut, flags: ProcessFlags) -> Result<()> {
        for plugin in &mut self.steps {
            if plugin.header().bypass {
                continue;
            }
            if let Err(err) = plugin.process(buffer, flags) {
                log::error!("plugin \"{}\" failed: {err}", plugin.header().name);
                plugin.header_mut().error = Some(err);
            }
        }
        Ok(())
    }

    /// Combined latency and guard requirements of the chain.
    pub fn get_specs(&self, samplerate: u32) -> PluginSpecs {
        let mut specs = PluginSpecs::default();
        for plugin in &self.steps {
            if plugin.header().bypass {
                continue;
            }
            specs = specs.combine_serial(plugin.get_specs(samplerate));
        }
        specs
    }

    /// Resets every plugin (transport cut).
    pub fn reset(&mut self) {
        for plugin in &mut self.steps {
            plugin.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PluginHeader, ProcessFlags};
    use mf_core::{Buffer, ChannelLayout, Error};

    struct FailingPlugin {
        header: PluginHeader,
    }

    impl Plugin for FailingPlugin {
        fn header(&self) -> &PluginHeader {
            &self.header
        }
        fn header_mut(&mut self) -> &mut PluginHeader {
            &mut self.header
        }
        fn process(&mut self, _buffer: &mut BufferMut, _flags: ProcessFlags) -> Result<()> {
            Err(Error::InvalidConfiguration)
        }
        fn reset(&mut self) {}
    }

    struct GainPlugin {
        header: PluginHeader,
        amp: f32,
    }

    impl Plugin for GainPlugin {
        fn header(&self) -> &PluginHeader {
            &self.header
        }
        fn header_mut(&mut self) -> &mut PluginHeader {
            &mut self.header
        }
        fn process(&mut self, buffer: &mut BufferMut, _flags: ProcessFlags) -> Result<()> {
            buffer.apply_gain(self.amp);
            Ok(())
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn errors_latch_without_stopping_the_chain() {
        let mut chain = DspChain::new();
        chain.append(Box::new(FailingPlugin { header: PluginHeader::new("fail") }));
        chain.append(Box::new(GainPlugin { header: PluginHeader::new("gain"), amp: 2.0 }));
        let mut buffer =
            Buffer::from_samples(vec![1.0f32; 8], ChannelLayout::mono(), 48000).unwrap();
        chain.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        assert_eq!(chain.get(0).unwrap().header().error, Some(Error::InvalidConfiguration));
        // The gain plugin after the failure still ran.
        assert_eq!(buffer.as_ref().sample(0, 0), 2.0);
    }

    #[test]
    fn bypass_skips_processing() {
        let mut chain = DspChain::new();
        let mut gain = GainPlugin { header: PluginHeader::new("gain"), amp: 2.0 };
        gain.header.bypass = true;
        chain.append(Box::new(gain));
        let mut buffer =
            Buffer::from_samples(vec![1.0f32; 8], ChannelLayout::mono(), 48000).unwrap();
        chain.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        assert_eq!(buffer.as_ref().sample(0, 0), 1.0);
    }

    #[test]
    fn order_is_insertion_order() {
        let mut chain = DspChain::new();
        chain.append(Box::new(GainPlugin { header: PluginHeader::new("a"), amp: 2.0 }));
        chain.prepend(Box::new(GainPlugin { header: PluginHeader::new("b"), amp: 3.0 }));
        assert_eq!(chain.get(0).unwrap().header().name, "b");
        assert_eq!(chain.get(1).unwrap().header().name, "a");
    }
}

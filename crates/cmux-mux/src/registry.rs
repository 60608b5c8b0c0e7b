use std::fmt;
use std::io::{Read, Write};

use tracing::{debug, info};

use crate::error::{MuxError, Result};
use crate::gsm0710::Gsm0710Multiplexer;
use crate::multiplexer::{MuxConfig, SerialMultiplexer};
use crate::passthrough::PassthroughMultiplexer;
use crate::probe::probe_cmux;

/// Raw, unframed access to the modem used while probing.
pub trait ModemIo: Read + Write {}

impl<T: Read + Write + ?Sized> ModemIo for T {}

type DetectFn = dyn Fn(&mut dyn ModemIo, &MuxConfig) -> Result<bool> + Send + Sync;
type CreateFn = dyn Fn(&MuxConfig) -> Box<dyn SerialMultiplexer> + Send + Sync;

/// A named way of multiplexing a modem: how to recognize it and how to build it.
pub struct MultiplexerVariant {
    name: String,
    detect: Box<DetectFn>,
    create: Box<CreateFn>,
}

impl MultiplexerVariant {
    pub fn new<D, C>(name: impl Into<String>, detect: D, create: C) -> Self
    where
        D: Fn(&mut dyn ModemIo, &MuxConfig) -> Result<bool> + Send + Sync + 'static,
        C: Fn(&MuxConfig) -> Box<dyn SerialMultiplexer> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            detect: Box::new(detect),
            create: Box::new(create),
        }
    }

    /// GSM 07.10 behind an `AT+CMUX` probe. A probe timeout counts as "not detected".
    pub fn gsm0710() -> Self {
        Self::new(
            "gsm0710",
            |io, config| match probe_cmux(io, config) {
                Ok(accepted) => Ok(accepted),
                Err(MuxError::Timeout(_)) => Ok(false),
                Err(err) => Err(err),
            },
            |config| Box::new(Gsm0710Multiplexer::new(config.clone())),
        )
    }

    /// Single raw channel; always detected.
    pub fn passthrough() -> Self {
        Self::new(
            "passthrough",
            |_, _| Ok(true),
            |_| Box::new(PassthroughMultiplexer::new()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MultiplexerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerVariant")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered list of multiplexer variants; the first one that detects wins.
#[derive(Debug, Default)]
pub struct MultiplexerRegistry {
    variants: Vec<MultiplexerVariant>,
}

impl MultiplexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// GSM 07.10 first, then passthrough.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MultiplexerVariant::gsm0710());
        registry.register(MultiplexerVariant::passthrough());
        registry
    }

    /// Append a variant. Variants are tried in registration order.
    pub fn register(&mut self, variant: MultiplexerVariant) {
        debug!(variant = variant.name(), "registered multiplexer variant");
        self.variants.push(variant);
    }

    pub fn names(&self) -> Vec<&str> {
        self.variants.iter().map(MultiplexerVariant::name).collect()
    }

    /// Look a variant up by name, skipping detection.
    pub fn create(&self, name: &str, config: &MuxConfig) -> Result<Box<dyn SerialMultiplexer>> {
        self.variants
            .iter()
            .find(|v| v.name == name)
            .map(|v| (v.create)(config))
            .ok_or_else(|| MuxError::ProbeFailed(format!("no multiplexer variant named {name:?}")))
    }

    /// Probe each variant in order and build the first one that matches.
    pub fn select(
        &self,
        io: &mut dyn ModemIo,
        config: &MuxConfig,
    ) -> Result<Box<dyn SerialMultiplexer>> {
        for variant in &self.variants {
            if (variant.detect)(&mut *io, config)? {
                info!(variant = variant.name(), "multiplexer selected");
                return Ok((variant.create)(config));
            }
            debug!(variant = variant.name(), "multiplexer variant not detected");
        }
        Err(MuxError::ProbeFailed(format!(
            "none of {:?} matched the device",
            self.names()
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn first_detected_variant_wins() {
        let mut registry = MultiplexerRegistry::new();
        registry.register(MultiplexerVariant::new(
            "never",
            |_, _| Ok(false),
            |config| Box::new(Gsm0710Multiplexer::new(config.clone())),
        ));
        registry.register(MultiplexerVariant::passthrough());
        registry.register(MultiplexerVariant::new(
            "unreached",
            |_, _| panic!("should not be probed"),
            |_| Box::new(PassthroughMultiplexer::new()),
        ));

        let mut io = Cursor::new(Vec::<u8>::new());
        let mux = registry.select(&mut io, &MuxConfig::default()).unwrap();
        assert_eq!(mux.name(), "passthrough");
    }

    #[test]
    fn nothing_detected_fails() {
        let mut registry = MultiplexerRegistry::new();
        registry.register(MultiplexerVariant::new(
            "never",
            |_, _| Ok(false),
            |_| Box::new(PassthroughMultiplexer::new()),
        ));
        let mut io = Cursor::new(Vec::<u8>::new());
        let err = registry.select(&mut io, &MuxConfig::default()).err();
        assert!(matches!(err, Some(MuxError::ProbeFailed(_))));
    }

    #[test]
    fn probe_errors_propagate() {
        let mut registry = MultiplexerRegistry::new();
        registry.register(MultiplexerVariant::new(
            "broken",
            |_, _| Err(MuxError::LinkDown),
            |_| Box::new(PassthroughMultiplexer::new()),
        ));
        registry.register(MultiplexerVariant::passthrough());
        let mut io = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            registry.select(&mut io, &MuxConfig::default()),
            Err(MuxError::LinkDown)
        ));
    }

    #[test]
    fn defaults_and_lookup() {
        let registry = MultiplexerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["gsm0710", "passthrough"]);

        let mux = registry.create("gsm0710", &MuxConfig::default()).unwrap();
        assert_eq!(mux.name(), "gsm0710");
        assert!(registry.create("nope", &MuxConfig::default()).is_err());
    }

    #[test]
    fn gsm0710_detected_on_ok() {
        struct Scripted {
            reply: Cursor<&'static [u8]>,
            written: Vec<u8>,
        }
        impl Read for Scripted {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.reply.read(buf)
            }
        }
        impl Write for Scripted {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.written.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut io = Scripted {
            reply: Cursor::new(&b"\r\nOK\r\n"[..]),
            written: Vec::new(),
        };
        let registry = MultiplexerRegistry::with_defaults();
        let mux = registry.select(&mut io, &MuxConfig::default()).unwrap();
        assert_eq!(mux.name(), "gsm0710");
        assert_eq!(io.written, b"AT+CMUX=0,0,5,31\r");
    }
}

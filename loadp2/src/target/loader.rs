//! Download protocol engine.
//!
//! Every strategy opens with the ROM's `Prop_Hex` command. What follows
//! depends on the strategy:
//!
//! ```text
//! SINGLE / SPI-FLASH   > Prop_Hex 0 0 0 0 [hex image in 128 B lines " > "] [checksum ?] | ~
//!
//! FPGA                 > Prop_Hex 0 0 0 0 [hex stub] [hex params] ~
//!                      size address (raw LE) image (raw)
//!
//! CHIP                 > Prop_Hex 0 0 0 0 [hex stub] [hex params] ~
//!                      0x80 ... until "@@ "
//!                      per block:  address size (raw LE) -> mode byte
//!                                  data (streamed or 1 KiB pieces)
//!                                  <- "@@"-style checksum reply
//!                                  '+' | '-' | '!'
//! ```
//!
//! Any timeout, checksum mismatch or unexpected byte ends the load. Nothing
//! is retried here; a fresh attempt starts over with discovery.

use std::fs;
use std::io;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::chain::{ChainEntry, Continuation};
use crate::image::{self, Image, ImageFormat, ImageOptions, Segment, args};
use crate::port::Port;
use crate::protocol::checksum::{self, Accumulator};
use crate::protocol::{
    self, ARGS_ADDRESS, AUTOBAUD_PROBE, BlockMode, CHAIN_DONE, CHAIN_MORE, CHECKSUM_ACCEPTED,
    CHECKSUM_REPLY_PREFIX, CHECKSUM_TRAILER, CHUNK_CONTINUATION, END_MARKER, ENTRY_COMMAND,
    HIMEM_ADDRESS, HIMEM_EXECUTE, MAX_PIECE,
};
use crate::target::stub::{HIMEM_HELPER, LoaderStubs};
use crate::target::{LoadStrategy, Session, SessionConfig, chip_timing, fpga_timing};

/// Bytes per hex line in the ROM loader protocol.
const ROM_HEX_CHUNK: usize = 128;

/// Word at this offset of a flash image holds its checksum.
const FLASH_CHECKSUM_SLOT: usize = 4;

/// Time for a loader stub to start after `~`.
const STAGE_BOOT_DELAY: Duration = Duration::from_millis(200);

/// Pause after the last byte before the program is considered running.
const SETTLE_AFTER_LOAD: Duration = Duration::from_millis(100);

/// Autobaud probes sent before giving up.
const AUTOBAUD_ATTEMPTS: usize = 16;

/// Wait for an autobaud reply before probing again.
const AUTOBAUD_INTERVAL: Duration = Duration::from_millis(20);

/// Wait for a checksum reply.
const CHECKSUM_TIMEOUT: Duration = Duration::from_millis(400);

/// Wait for a mode byte.
const MODE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wait for the ROM's checksum verdict.
const ROM_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Back-off after a busy reply.
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Busy replies tolerated for one block.
const MAX_BUSY_RETRIES: usize = 100;

/// Longest error message read after an `'e'` reply.
const MAX_ERROR_MESSAGE: usize = 256;

/// Progress callback: `(block name, bytes sent, block size)`.
pub type Progress<'a> = dyn FnMut(&str, usize, usize) + 'a;

/// One addressed block of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Shown in progress and logs.
    pub name: String,
    /// Hub address.
    pub address: u32,
    /// Bytes to transfer.
    pub data: Vec<u8>,
}

/// One chain file, read and parsed.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Chain entry the file came from.
    pub entry: ChainEntry,
    /// Shown in progress and logs.
    pub name: String,
    /// Raw or flattened ELF image, size word included when requested.
    pub image: Image,
    /// `PT_LOAD` segments when the file is ELF.
    pub segments: Option<Vec<Segment>>,
}

impl SourceFile {
    fn read(entry: &ChainEntry) -> Result<Self> {
        let path = &entry.path;
        let raw = fs::read(path)
            .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
        let name = path.display().to_string();
        let image = Image::from_bytes(
            &raw,
            &ImageOptions {
                prepend: Vec::new(),
                size_prefix: entry.size_prefix,
            },
        )?;
        let segments = image::elf_segments(&raw)?;
        if image.format == ImageFormat::Elf {
            debug!("{name}: flattened ELF, {} bytes", image.len());
        }
        Ok(Self {
            entry: entry.clone(),
            name,
            image,
            segments,
        })
    }

    /// Hub address: the chain's `@addr`, then the ELF base, then the default.
    pub fn address(&self, config: &SessionConfig) -> u32 {
        self.entry
            .address
            .or(self.image.elf_base)
            .unwrap_or(config.default_address)
    }

    fn section_direct(&self, config: &SessionConfig, strategy: LoadStrategy) -> Option<&[Segment]> {
        if strategy != LoadStrategy::Chip
            || self.entry.address.is_some()
            || self.entry.size_prefix
            || self.address(config) != 0
        {
            return None;
        }
        self.segments.as_deref()
    }

    fn blocks(
        &self,
        config: &SessionConfig,
        strategy: LoadStrategy,
        clock_mode: u32,
        patch: bool,
    ) -> Result<Vec<Block>> {
        if let Some(segments) = self.section_direct(config, strategy) {
            debug!("{}: loading {} ELF segments directly", self.name, segments.len());
            let mut blocks: Vec<Block> = segments
                .iter()
                .enumerate()
                .map(|(i, s)| Block {
                    name: format!("{} [{i}]", self.name),
                    address: s.address,
                    data: s.data.clone(),
                })
                .collect();
            if patch {
                patch_segment_clock(&mut blocks, config, clock_mode)?;
            }
            return Ok(blocks);
        }

        let mut image = self.image.clone();
        if patch {
            image.patch_clock(config.clock_freq, clock_mode, config.user_baud)?;
        }
        Ok(vec![Block {
            name: self.name.clone(),
            address: self.address(config),
            data: image.data,
        }])
    }

    /// Whether the clock patch fits both layouts this file can be sent in.
    fn patchable(&self) -> bool {
        let segment_ok = self.segments.as_ref().is_none_or(|segments| {
            segments
                .iter()
                .find(|s| s.address == 0)
                .is_none_or(|s| s.data.len() >= image::CLOCK_PATCH_END)
        });
        self.image.can_patch_clock() && segment_ok
    }
}

/// Every file and the arguments block of a load, read before the target is
/// reset. Only the strategy-specific layout is left for [`LoadPlan::assemble`].
#[derive(Debug, Clone, Default)]
pub struct LoadSources {
    /// Chain files in order.
    pub files: Vec<SourceFile>,
    /// Encoded arguments block.
    pub args: Option<Vec<u8>>,
}

impl LoadSources {
    /// Read and parse every chain entry.
    pub fn read(entries: &[ChainEntry], config: &SessionConfig) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::InvalidChain("no files to load".into()));
        }
        let files = entries
            .iter()
            .map(SourceFile::read)
            .collect::<Result<Vec<_>>>()?;
        if config.patch && !files[0].patchable() {
            return Err(Error::Unsupported(format!(
                "{} is too small for the clock patch",
                files[0].name
            )));
        }
        Ok(Self { files, args: None })
    }

    /// Encode program arguments.
    pub fn with_args<S: AsRef<str>>(mut self, program_args: &[S]) -> Result<Self> {
        self.args = Some(args::build_block(program_args)?);
        Ok(self)
    }
}

/// Everything one load sends, built before the port is written to.
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    /// Stage sent after `Prop_Hex` (chip or FPGA loader).
    pub stage: Option<Vec<u8>>,
    /// Stage the himem helper before the first block.
    pub himem: bool,
    /// Blocks in chain order.
    pub blocks: Vec<Block>,
    /// Encoded arguments block.
    pub args: Option<Vec<u8>>,
}

impl LoadPlan {
    /// Read and build every chain entry for `strategy`.
    pub fn build(
        entries: &[ChainEntry],
        config: &SessionConfig,
        strategy: LoadStrategy,
        clock_mode: u32,
        stubs: &LoaderStubs,
    ) -> Result<Self> {
        let sources = LoadSources::read(entries, config)?;
        Self::assemble(&sources, config, strategy, clock_mode, stubs)
    }

    /// Lay already-read sources out for `strategy`.
    pub fn assemble(
        sources: &LoadSources,
        config: &SessionConfig,
        strategy: LoadStrategy,
        clock_mode: u32,
        stubs: &LoaderStubs,
    ) -> Result<Self> {
        let files = &sources.files;
        if files.is_empty() {
            return Err(Error::InvalidChain("no files to load".into()));
        }
        if files.len() > 1 && strategy != LoadStrategy::Chip {
            return Err(Error::Unsupported(format!(
                "{strategy} loads take a single file, {} given",
                files.len()
            )));
        }

        let mut blocks = Vec::new();
        for (index, file) in files.iter().enumerate() {
            let patch = config.patch && index == 0;
            blocks.extend(file.blocks(config, strategy, clock_mode, patch)?);
        }

        if strategy == LoadStrategy::SpiFlash {
            let user = blocks.remove(0);
            let mut flash = Image::from_payload(
                &user.data,
                &ImageOptions {
                    prepend: stubs.flash_loader()?.to_vec(),
                    size_prefix: true,
                },
            )?;
            flash.patch_flash_checksum(FLASH_CHECKSUM_SLOT)?;
            debug!("Flash image {} bytes", flash.len());
            blocks.insert(
                0,
                Block {
                    name: user.name,
                    address: 0,
                    data: flash.data,
                },
            );
        }

        if strategy.uses_rom_hex() && blocks.iter().any(|b| b.address != 0) {
            return Err(Error::Unsupported(format!(
                "{strategy} loads always start at address 0"
            )));
        }
        if blocks.iter().all(|b| b.data.is_empty()) {
            return Err(Error::InvalidChain("nothing to load, every file is empty".into()));
        }

        Ok(Self {
            stage: stubs.stage_for(strategy)?.map(<[u8]>::to_vec),
            himem: false,
            blocks,
            args: sources.args.clone(),
        })
    }

    /// Build the plan for an open session.
    pub fn for_session<P: Port>(
        session: &Session<P>,
        sources: &LoadSources,
        stubs: &LoaderStubs,
    ) -> Result<Self> {
        Self::assemble(
            sources,
            session.config(),
            session.strategy(),
            session.clock_mode(),
            stubs,
        )
    }

    /// Append a program arguments block.
    pub fn with_args<S: AsRef<str>>(mut self, program_args: &[S]) -> Result<Self> {
        self.args = Some(args::build_block(program_args)?);
        Ok(self)
    }

    /// Stage the himem helper first.
    #[must_use]
    pub fn with_himem(mut self, himem: bool) -> Self {
        self.himem = himem;
        self
    }

    /// Bytes of user data in the plan.
    pub fn total_bytes(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.data.len())
            .sum()
    }
}

fn patch_segment_clock(blocks: &mut [Block], config: &SessionConfig, clock_mode: u32) -> Result<()> {
    let target = blocks
        .iter_mut()
        .find(|b| b.address == 0)
        .ok_or_else(|| Error::Unsupported("no ELF segment at address 0 to patch".into()))?;
    let mut image = Image::from_payload(&target.data, &ImageOptions::default())?;
    image.patch_clock(config.clock_freq, clock_mode, config.user_baud)?;
    target.data = image.data;
    Ok(())
}

fn ensure_not_interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

impl<P: Port> Session<P> {
    /// Transfer `plan` to the target using the session's strategy.
    pub fn load(&mut self, plan: &LoadPlan, progress: &mut Progress<'_>) -> Result<()> {
        ensure_not_interrupted()?;
        match self.strategy() {
            LoadStrategy::Chip => self.load_chip(plan, progress),
            LoadStrategy::Fpga => self.load_fpga(plan, progress),
            LoadStrategy::Single | LoadStrategy::SpiFlash => self.load_rom_hex(plan, progress),
        }
    }

    fn load_rom_hex(&mut self, plan: &LoadPlan, progress: &mut Progress<'_>) -> Result<()> {
        let [block] = plan.blocks.as_slice() else {
            return Err(Error::Unsupported(format!(
                "{} loads take exactly one block",
                self.strategy()
            )));
        };
        if plan.himem || plan.args.is_some() {
            return Err(Error::Unsupported(format!(
                "{} loads cannot carry arguments or the himem helper",
                self.strategy()
            )));
        }
        info!("Loading {} - {} bytes", block.name, block.data.len());

        let port = self.port_mut();
        port.send(ENTRY_COMMAND)?;
        let total = block.data.len();
        let mut sent = 0;
        for chunk in block.data.chunks(ROM_HEX_CHUNK) {
            let mut line = protocol::hex_bytes(chunk);
            line.extend_from_slice(CHUNK_CONTINUATION);
            port.send(&line)?;
            sent += chunk.len();
            progress(&block.name, sent, total);
        }

        if self.config().checksum {
            let mut tail = Vec::with_capacity(13);
            protocol::push_hex_word(&mut tail, checksum::rom_checksum(&block.data));
            tail.push(CHECKSUM_TRAILER);
            let port = self.port_mut();
            port.send(&tail)?;
            port.drain()?;

            let mut reply = [0u8; 1];
            let n = port.receive_exact_timeout(&mut reply, ROM_ACK_TIMEOUT)?;
            if n == 0 {
                return Err(Error::Timeout(format!(
                    "no checksum verdict for {}",
                    block.name
                )));
            }
            if reply[0] != CHECKSUM_ACCEPTED {
                return Err(Error::protocol(
                    format!("{:?} ({} failed to load)", char::from(CHECKSUM_ACCEPTED), block.name),
                    &reply,
                ));
            }
            debug!("Checksum validated");
        } else {
            let port = self.port_mut();
            port.send(&[END_MARKER])?;
            port.drain()?;
        }

        thread::sleep(SETTLE_AFTER_LOAD);
        info!("{} loaded", block.name);
        Ok(())
    }

    fn send_stage(&mut self, stage: &[u8], timing: (u32, u32)) -> Result<()> {
        let mut command = ENTRY_COMMAND.to_vec();
        command.extend_from_slice(&protocol::hex_bytes(stage));
        for word in [self.clock_mode(), timing.0, timing.1, self.config().flag_bits()] {
            protocol::push_hex_word(&mut command, word);
        }
        command.push(END_MARKER);

        debug!(
            "Sending {} byte {} loader",
            stage.len(),
            self.strategy()
        );
        let port = self.port_mut();
        port.send(&command)?;
        port.drain()?;
        thread::sleep(STAGE_BOOT_DELAY);
        Ok(())
    }

    fn load_fpga(&mut self, plan: &LoadPlan, progress: &mut Progress<'_>) -> Result<()> {
        let [block] = plan.blocks.as_slice() else {
            return Err(Error::Unsupported("FPGA loads take exactly one block".into()));
        };
        if plan.himem || plan.args.is_some() {
            return Err(Error::Unsupported(
                "FPGA loads cannot carry arguments or the himem helper".into(),
            ));
        }
        let stage = plan
            .stage
            .as_deref()
            .ok_or_else(|| Error::Config("FPGA load without a loader stub".into()))?;
        let config = self.config();
        let timing = fpga_timing(config.clock_freq, config.loader_baud, config.extra_cycles);
        self.send_stage(stage, timing)?;

        let size = u32::try_from(block.data.len()).map_err(|_| Error::ImageTooLarge {
            size: block.data.len(),
            limit: u32::MAX as usize,
        })?;
        info!("Loading {} - {size} bytes", block.name);
        let mut header = size.to_le_bytes().to_vec();
        header.extend_from_slice(&block.address.to_le_bytes());
        let port = self.port_mut();
        port.send(&header)?;
        stream(port, &block.name, &block.data, 0, &mut Accumulator::new(), progress)?;
        port.drain()?;

        thread::sleep(SETTLE_AFTER_LOAD);
        info!("{} loaded", block.name);
        Ok(())
    }

    fn load_chip(&mut self, plan: &LoadPlan, progress: &mut Progress<'_>) -> Result<()> {
        let stage = plan
            .stage
            .as_deref()
            .ok_or_else(|| Error::Config("CHIP load without a loader stub".into()))?;
        let config = self.config();
        let timing = chip_timing(config.clock_freq, config.loader_baud);
        self.send_stage(stage, timing)?;
        self.autobaud()?;

        if plan.himem {
            info!("Staging himem helper at {HIMEM_ADDRESS:#x}");
            self.send_block("himem", HIMEM_ADDRESS, HIMEM_HELPER, HIMEM_EXECUTE, progress)?;
        }

        let blocks: Vec<&Block> = plan
            .blocks
            .iter()
            .filter(|b| !b.data.is_empty())
            .collect();
        for (index, block) in blocks.iter().enumerate() {
            ensure_not_interrupted()?;
            let continuation = if index + 1 < blocks.len() || plan.args.is_some() {
                Continuation::More
            } else {
                Continuation::Stop
            };
            info!(
                "Loading {} - {} bytes at {:#x}",
                block.name,
                block.data.len(),
                block.address
            );
            let marker = match continuation {
                Continuation::More => CHAIN_MORE,
                Continuation::Stop => CHAIN_DONE,
            };
            self.send_block(&block.name, block.address, &block.data, marker, progress)?;
        }

        if let Some(args) = &plan.args {
            ensure_not_interrupted()?;
            debug!("Sending {} byte arguments block", args.len());
            self.send_block("args", ARGS_ADDRESS, args, CHAIN_DONE, progress)?;
        }

        thread::sleep(SETTLE_AFTER_LOAD);
        Ok(())
    }

    /// Probe with 0x80 until the chip loader answers `"@@ "`.
    fn autobaud(&mut self) -> Result<()> {
        let port = self.port_mut();
        for attempt in 1..=AUTOBAUD_ATTEMPTS {
            port.send(&[AUTOBAUD_PROBE])?;
            let mut reply = [0u8; 3];
            let n = port.receive_exact_timeout(&mut reply, AUTOBAUD_INTERVAL)?;
            if n == 0 {
                trace!("Autobaud probe {attempt}: no reply");
                continue;
            }

            let mut got = reply[..n].to_vec();
            // The chip loader sometimes emits a stray zero while its UART settles.
            if got[0] == 0 {
                trace!("Dropping leading zero before the initial checksum");
                got.remove(0);
            }
            while got.len() < 3 {
                let mut rest = [0u8; 3];
                let want = 3 - got.len();
                let m = port.receive_exact_timeout(&mut rest[..want], CHECKSUM_TIMEOUT)?;
                if m == 0 {
                    return Err(Error::Timeout(format!(
                        "initial checksum incomplete, got {} bytes",
                        got.len()
                    )));
                }
                got.extend_from_slice(&rest[..m]);
            }
            if !got.starts_with(CHECKSUM_REPLY_PREFIX) {
                return Err(Error::protocol("initial checksum \"@@\"", &got));
            }
            debug!("Chip loader answered autobaud after {attempt} probes");
            return Ok(());
        }
        Err(Error::Timeout(
            "chip loader did not answer the autobaud probe".into(),
        ))
    }

    /// One addressed block of the chip loader protocol.
    fn send_block(
        &mut self,
        name: &str,
        address: u32,
        data: &[u8],
        marker: u8,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(data.len()).map_err(|_| Error::ImageTooLarge {
            size: data.len(),
            limit: u32::MAX as usize,
        })?;
        let header = protocol::block_header(address, size);
        let port = self.port_mut();

        let mut busy = 0;
        let mut mode = loop {
            port.send(&header)?;
            match read_mode(port, address)? {
                BlockMode::Wait => {
                    busy += 1;
                    if busy > MAX_BUSY_RETRIES {
                        return Err(Error::Timeout(format!(
                            "loader stayed busy for block at {address:#x}"
                        )));
                    }
                    thread::sleep(BUSY_BACKOFF);
                },
                mode => break mode,
            }
        };

        let mut sum = Accumulator::new();
        let mut offset = 0;
        while offset < data.len() {
            match mode {
                BlockMode::Stream => {
                    offset = stream(port, name, data, offset, &mut sum, progress)?;
                },
                _ => {
                    let end = (offset + MAX_PIECE).min(data.len());
                    let piece = &data[offset..end];
                    port.send(piece)?;
                    sum.update(piece);
                    offset = end;
                    progress(name, offset, data.len());
                    if offset < data.len() {
                        mode = read_mode(port, address)?;
                        if mode == BlockMode::Wait {
                            return Err(Error::protocol("'k' or 's' between pieces", b"w"));
                        }
                    }
                },
            }
        }

        port.drain()?;
        let mut reply = [0u8; 3];
        let n = port.receive_exact_timeout(&mut reply, CHECKSUM_TIMEOUT)?;
        if n < reply.len() {
            return Err(Error::Timeout(format!(
                "checksum reply for {name}: got {n} of 3 bytes"
            )));
        }
        let actual = checksum::decode_reply(&reply)?;
        let expected = sum.low_byte();
        if actual != expected {
            warn!("{name}: checksum reply {:?}", String::from_utf8_lossy(&reply));
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        debug!("{name}: checksum {actual:#04x} OK");

        port.send(&[marker])?;
        Ok(())
    }
}

/// Send `data[offset..]` without waiting, in slices for progress reporting.
fn stream<P: Port>(
    port: &mut P,
    name: &str,
    data: &[u8],
    offset: usize,
    sum: &mut Accumulator,
    progress: &mut Progress<'_>,
) -> Result<usize> {
    let mut sent = offset;
    for piece in data[offset..].chunks(MAX_PIECE) {
        port.send(piece)?;
        sum.update(piece);
        sent += piece.len();
        progress(name, sent, data.len());
    }
    Ok(sent)
}

/// Read and act on one mode byte. `Wait` is returned to the caller; errors,
/// himem requests and unknown bytes end the load.
fn read_mode<P: Port>(port: &mut P, address: u32) -> Result<BlockMode> {
    let mut byte = [0u8; 1];
    if port.receive_exact_timeout(&mut byte, MODE_TIMEOUT)? == 0 {
        return Err(Error::Timeout(format!(
            "no reply to block header for {address:#x}"
        )));
    }
    match BlockMode::from_byte(byte[0]) {
        Some(BlockMode::Error) => Err(Error::DeviceError(read_error_message(port)?)),
        Some(BlockMode::Himem) => Err(Error::HimemRequired { address }),
        Some(mode) => Ok(mode),
        None => Err(Error::protocol("mode byte s/k/w/e/h", &byte)),
    }
}

fn read_error_message<P: Port>(port: &mut P) -> Result<String> {
    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    while message.len() < MAX_ERROR_MESSAGE {
        if port.receive_exact_timeout(&mut byte, CHECKSUM_TIMEOUT)? == 0 {
            break;
        }
        match byte[0] {
            0 | b'\n' => break,
            b'\r' => {},
            b => message.push(b),
        }
    }
    Ok(String::from_utf8_lossy(&message).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::chain;
    use crate::port::mock::MockPort;
    use crate::protocol::checksum::encode_reply;

    const STUB: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF];

    fn chip_session(port: MockPort) -> Session<MockPort> {
        let config = SessionConfig::default()
            .with_loader_baud(2_000_000)
            .with_strategy(LoadStrategy::Chip);
        Session::new(port, config, Some('G'))
    }

    fn chip_plan(blocks: Vec<Block>) -> LoadPlan {
        LoadPlan {
            stage: Some(STUB.to_vec()),
            himem: false,
            blocks,
            args: None,
        }
    }

    fn block(address: u32, data: Vec<u8>) -> Block {
        Block {
            name: format!("blk{address:x}"),
            address,
            data,
        }
    }

    fn reply_for(data: &[u8]) -> [u8; 3] {
        let mut acc = Accumulator::new();
        acc.update(data);
        encode_reply(acc.low_byte())
    }

    /// Written bytes after the stage command and the (single) autobaud probe.
    fn after_autobaud(port: &MockPort) -> &[u8] {
        let probe = port
            .written
            .iter()
            .position(|&b| b == AUTOBAUD_PROBE)
            .unwrap();
        &port.written[probe + 1..]
    }

    fn no_progress() -> impl FnMut(&str, usize, usize) {
        |_: &str, _: usize, _: usize| {}
    }

    #[test]
    fn test_chip_stage_command_layout() {
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&reply_for(&[1, 2, 3, 4]));
        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0, vec![1, 2, 3, 4])]);
        session.load(&plan, &mut no_progress()).unwrap();

        let mut expected = ENTRY_COMMAND.to_vec();
        expected.extend_from_slice(b" de ad be ef");
        expected.extend_from_slice(b" f8 27 24 01"); // clock mode
        expected.extend_from_slice(b" 00 00 3c 00"); // bit15 period
        expected.extend_from_slice(b" 00 00 28 00"); // bit period
        expected.extend_from_slice(b" 01 00 00 00"); // flags
        expected.push(b'~');
        let written = &session.port().written;
        assert!(written.starts_with(&expected));
        assert_eq!(written[expected.len()], AUTOBAUD_PROBE);
    }

    #[test]
    fn test_chip_single_block_wire_sequence() {
        let data = vec![0x11u8; 8];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        session
            .load(&chip_plan(vec![block(0x400, data.clone())]), &mut no_progress())
            .unwrap();

        let mut expected = protocol::block_header(0x400, 8);
        expected.extend_from_slice(&data);
        expected.push(CHAIN_DONE);
        assert_eq!(after_autobaud(session.port()), expected.as_slice());
    }

    #[test]
    fn test_chip_flow_control_pieces_then_stream() {
        let data: Vec<u8> = (0..3000u32).map(|i| u8::try_from(i % 251).unwrap()).collect();
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"k");
        port.queue(b"k");
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        let mut reports = Vec::new();
        session
            .load(
                &chip_plan(vec![block(0, data.clone())]),
                &mut |_: &str, sent, total| reports.push((sent, total)),
            )
            .unwrap();

        let sizes = &session.port().write_sizes;
        let header_at = sizes.iter().rposition(|&s| s == 8).unwrap();
        assert_eq!(&sizes[header_at + 1..], &[1024, 1024, 952, 1]);
        assert!(sizes[header_at + 1..].iter().all(|&s| s <= MAX_PIECE));
        assert_eq!(reports.last(), Some(&(3000, 3000)));
        assert!(after_autobaud(session.port()).ends_with(&[CHAIN_DONE]));
    }

    #[test]
    fn test_chip_chain_markers_and_args() {
        let first = vec![1u8; 4];
        let second = vec![2u8; 4];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        for data in [&first, &second] {
            port.queue(b"s");
            port.queue(&reply_for(data));
        }
        let args = args::build_block(&["prog"]).unwrap();
        port.queue(b"s");
        port.queue(&reply_for(&args));

        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0, first), block(0x8000, second)])
            .with_args(&["prog"])
            .unwrap();
        session.load(&plan, &mut no_progress()).unwrap();

        let tail = after_autobaud(session.port());
        // header + 4 data + marker, twice, then the args block
        assert_eq!(tail[12], CHAIN_MORE);
        assert_eq!(tail[25], CHAIN_MORE);
        assert_eq!(&tail[26..34], protocol::block_header(ARGS_ADDRESS, 1024).as_slice());
        assert_eq!(&tail[34..38], b"ARGv");
        assert_eq!(*tail.last().unwrap(), CHAIN_DONE);
    }

    #[test]
    fn test_chip_checksum_mismatch_stops_chain() {
        let first = vec![5u8; 4];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&encode_reply(0x00));
        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0, first), block(0x1000, vec![6u8; 4])]);

        let err = session.load(&plan, &mut no_progress()).unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                expected: 20,
                actual: 0
            }
        ));
        let tail = after_autobaud(session.port());
        // Only the first header and its data; no marker, no second block.
        assert_eq!(tail.len(), 12);
    }

    #[test]
    fn test_chip_garbled_checksum_reply_is_mismatch() {
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(b"@z ");
        let mut session = chip_session(port);
        let err = session
            .load(&chip_plan(vec![block(0, vec![5u8; 4])]), &mut no_progress())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                expected: 20,
                actual: 0x0A
            }
        ));
        assert!(err.to_string().contains("FIFO"));
    }

    #[test]
    fn test_chip_busy_resends_header() {
        let data = vec![3u8; 4];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"w");
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        session
            .load(&chip_plan(vec![block(0x20, data)]), &mut no_progress())
            .unwrap();
        let tail = after_autobaud(session.port());
        let header = protocol::block_header(0x20, 4);
        assert_eq!(&tail[..8], header.as_slice());
        assert_eq!(&tail[8..16], header.as_slice());
    }

    #[test]
    fn test_chip_device_error_and_himem_request() {
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"eaddress too high\0");
        let mut session = chip_session(port);
        let err = session
            .load(&chip_plan(vec![block(0, vec![0; 4])]), &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, Error::DeviceError(ref m) if m == "address too high"));

        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"h");
        let mut session = chip_session(port);
        let err = session
            .load(&chip_plan(vec![block(0x0100_0000, vec![0; 4])]), &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, Error::HimemRequired { address: 0x0100_0000 }));
    }

    #[test]
    fn test_chip_unknown_mode_byte_is_protocol_error() {
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"?");
        let mut session = chip_session(port);
        let err = session
            .load(&chip_plan(vec![block(0, vec![0; 4])]), &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_chip_autobaud_drops_leading_zero() {
        let data = vec![9u8; 4];
        let mut port = MockPort::new();
        port.queue(b"\0@@");
        port.queue(b" ");
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        session
            .load(&chip_plan(vec![block(0, data)]), &mut no_progress())
            .unwrap();
    }

    #[test]
    fn test_chip_autobaud_rejects_bad_reply() {
        let mut port = MockPort::new();
        port.queue(b"x@ ");
        let mut session = chip_session(port);
        let err = session
            .load(&chip_plan(vec![block(0, vec![0; 4])]), &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_chip_skips_empty_blocks() {
        let data = vec![4u8; 4];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0, data), block(0x1000, Vec::new())]);
        session.load(&plan, &mut no_progress()).unwrap();
        let tail = after_autobaud(session.port());
        assert_eq!(tail.len(), 13);
        assert_eq!(tail[12], CHAIN_DONE);
    }

    #[test]
    fn test_chip_himem_staged_first() {
        let data = vec![8u8; 4];
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&reply_for(HIMEM_HELPER));
        port.queue(b"s");
        port.queue(&reply_for(&data));
        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0, data)]).with_himem(true);
        session.load(&plan, &mut no_progress()).unwrap();

        let tail = after_autobaud(session.port());
        let helper_len = HIMEM_HELPER.len();
        assert_eq!(
            &tail[..8],
            protocol::block_header(HIMEM_ADDRESS, u32::try_from(helper_len).unwrap()).as_slice()
        );
        assert_eq!(tail[8 + helper_len], HIMEM_EXECUTE);
    }

    #[test]
    fn test_chip_himem_reply_after_helper_staged() {
        let mut port = MockPort::new();
        port.queue(b"@@ ");
        port.queue(b"s");
        port.queue(&reply_for(HIMEM_HELPER));
        port.queue(b"h");
        let mut session = chip_session(port);
        let plan = chip_plan(vec![block(0x0180_0000, vec![1u8; 4])]).with_himem(true);
        let err = session.load(&plan, &mut no_progress()).unwrap_err();
        assert!(matches!(err, Error::HimemRequired { address: 0x0180_0000 }));
        assert!(!err.to_string().contains("not loaded"));
    }

    #[test]
    fn test_single_hex_stream_with_checksum() {
        let data = vec![0x01u8, 0x00, 0x00, 0x00];
        let mut port = MockPort::new();
        port.queue(b".");
        let config = SessionConfig::default().with_strategy(LoadStrategy::Single);
        let mut session = Session::new(port, config, Some('G'));
        let plan = LoadPlan {
            blocks: vec![block(0, data)],
            ..LoadPlan::default()
        };
        session.load(&plan, &mut no_progress()).unwrap();

        let mut expected = ENTRY_COMMAND.to_vec();
        expected.extend_from_slice(b" 01 00 00 00 > ");
        // 0x706F7250 - 1
        expected.extend_from_slice(b" 4f 72 6f 70?");
        assert_eq!(session.port().written, expected);
    }

    #[test]
    fn test_single_rejected_checksum_fails() {
        let mut port = MockPort::new();
        port.queue(b"x");
        let config = SessionConfig::default().with_strategy(LoadStrategy::Single);
        let mut session = Session::new(port, config, None);
        let plan = LoadPlan {
            blocks: vec![block(0, vec![0; 4])],
            ..LoadPlan::default()
        };
        assert!(matches!(
            session.load(&plan, &mut no_progress()),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_single_without_checksum_ends_with_tilde() {
        let config = SessionConfig {
            checksum: false,
            ..SessionConfig::default().with_strategy(LoadStrategy::Single)
        };
        let mut session = Session::new(MockPort::new(), config, None);
        let plan = LoadPlan {
            blocks: vec![block(0, vec![0xAB; 200])],
            ..LoadPlan::default()
        };
        session.load(&plan, &mut no_progress()).unwrap();
        let written = &session.port().written;
        assert_eq!(written.last(), Some(&END_MARKER));
        let lines = written
            .windows(CHUNK_CONTINUATION.len())
            .filter(|w| *w == CHUNK_CONTINUATION)
            .count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_fpga_sends_raw_size_and_address() {
        let config = SessionConfig::default()
            .with_loader_baud(2_000_000)
            .with_strategy(LoadStrategy::Fpga);
        let mut session = Session::new(MockPort::new(), config, Some('B'));
        let plan = LoadPlan {
            stage: Some(STUB.to_vec()),
            blocks: vec![block(0, vec![7u8; 8])],
            ..LoadPlan::default()
        };
        session.load(&plan, &mut no_progress()).unwrap();

        let mut stage = ENTRY_COMMAND.to_vec();
        stage.extend_from_slice(b" de ad be ef");
        stage.extend_from_slice(b" ff 00 00 00"); // 80 MHz / 312.5 kHz - 1
        stage.extend_from_slice(b" 35 00 00 00"); // 1.5 bits less 7 extra cycles
        stage.extend_from_slice(b" 21 00 00 00"); // 1 bit less 7 extra cycles
        stage.extend_from_slice(b" 01 00 00 00"); // flags
        stage.push(END_MARKER);
        let written = &session.port().written;
        assert!(written.starts_with(&stage));
        let tail = &written[stage.len()..];
        assert_eq!(&tail[..4], &8u32.to_le_bytes());
        assert_eq!(&tail[4..8], &0u32.to_le_bytes());
        assert_eq!(&tail[8..], &[7u8; 8]);
    }

    #[test]
    fn test_plan_from_chain_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), [1u8, 2, 3]).unwrap();
        std::fs::write(dir.path().join("b"), [4u8; 4]).unwrap();
        let files = format!(
            "@1000={},@2000+{}",
            dir.path().join("a").display(),
            dir.path().join("b").display()
        );
        let entries = chain::parse(&files).unwrap();
        let stubs = LoaderStubs::from_parts(Some(STUB.to_vec()), None, None);
        let plan = LoadPlan::build(
            &entries,
            &SessionConfig::default(),
            LoadStrategy::Chip,
            0,
            &stubs,
        )
        .unwrap();

        assert_eq!(plan.stage.as_deref(), Some(STUB));
        assert_eq!(plan.blocks.len(), 2);
        assert_eq!(plan.blocks[0].address, 0x1000);
        assert_eq!(plan.blocks[0].data, vec![1, 2, 3, 0]);
        assert_eq!(plan.blocks[1].address, 0x2000);
        assert_eq!(&plan.blocks[1].data[..4], &4u32.to_le_bytes());
        assert_eq!(plan.total_bytes(), 12);
    }

    #[test]
    fn test_plan_elf_at_zero_loads_segments_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.elf");
        let elf = crate::image::elf::tests::build_elf(&[(0, &[1; 4], 4), (0x10000, &[2; 4], 8)]);
        std::fs::write(&path, elf).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let stubs = LoaderStubs::from_parts(Some(STUB.to_vec()), None, None);
        let plan = LoadPlan::build(
            &entries,
            &SessionConfig::default(),
            LoadStrategy::Chip,
            0,
            &stubs,
        )
        .unwrap();
        assert_eq!(plan.blocks.len(), 2);
        assert_eq!(plan.blocks[1].address, 0x10000);
        assert_eq!(plan.blocks[1].data, vec![2, 2, 2, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_plan_spi_flash_patches_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [0x55u8; 10]).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let stubs = LoaderStubs::from_parts(None, None, Some(vec![0u8; 16]));
        let plan = LoadPlan::build(
            &entries,
            &SessionConfig::default(),
            LoadStrategy::SpiFlash,
            0,
            &stubs,
        )
        .unwrap();

        let data = &plan.blocks[0].data;
        assert_eq!(data.len(), 16 + 4 + 12);
        // The user image is word-padded before the size word is taken.
        assert_eq!(&data[16..20], &12u32.to_le_bytes());
        assert_eq!(checksum::word_sum(data), 0);
        assert!(plan.stage.is_none());
    }

    #[test]
    fn test_plan_rejects_multi_file_single() {
        let entries = chain::parse("a,b").unwrap();
        let err = LoadPlan::build(
            &entries,
            &SessionConfig::default(),
            LoadStrategy::Single,
            0,
            &LoaderStubs::none(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_plan_missing_file_is_io_error() {
        let entries = chain::parse("/no/such/file.bin").unwrap();
        let err = LoadPlan::build(
            &entries,
            &SessionConfig::default(),
            LoadStrategy::Chip,
            0,
            &LoaderStubs::none(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("/no/such/file.bin"));
    }

    #[test]
    fn test_sources_keep_elf_base_as_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("high.elf");
        let elf = crate::image::elf::tests::build_elf(&[(0x2000, &[3; 8], 8)]);
        std::fs::write(&path, elf).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let config = SessionConfig::default();
        let sources = LoadSources::read(&entries, &config).unwrap();
        assert_eq!(sources.files[0].address(&config), 0x2000);

        let stubs = LoaderStubs::from_parts(Some(STUB.to_vec()), None, None);
        let plan = LoadPlan::assemble(&sources, &config, LoadStrategy::Chip, 0, &stubs).unwrap();
        assert_eq!(plan.blocks.len(), 1);
        assert_eq!(plan.blocks[0].address, 0x2000);
        assert_eq!(plan.blocks[0].data, vec![3; 8]);

        let explicit = chain::parse(&format!("@4000={}", path.display())).unwrap();
        let sources = LoadSources::read(&explicit, &config).unwrap();
        assert_eq!(sources.files[0].address(&config), 0x4000);
    }

    #[test]
    fn test_sources_reject_broken_elf_without_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.elf");
        std::fs::write(&path, crate::image::elf::tests::build_elf(&[])).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let err = LoadSources::read(&entries, &SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidElf(_)));
    }

    #[test]
    fn test_sources_reject_arguments_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let sources = LoadSources::read(&entries, &SessionConfig::default()).unwrap();
        let many: Vec<String> = (0..40).map(|i| format!("a{i}")).collect();
        assert!(matches!(
            sources.clone().with_args(&many),
            Err(Error::InvalidArguments(_))
        ));

        let sources = sources.with_args(&["prog", "-v"]).unwrap();
        let stubs = LoaderStubs::from_parts(Some(STUB.to_vec()), None, None);
        let plan = LoadPlan::assemble(
            &sources,
            &SessionConfig::default(),
            LoadStrategy::Chip,
            0,
            &stubs,
        )
        .unwrap();
        assert_eq!(plan.args.as_deref().map(|a| &a[..4]), Some(&b"ARGv"[..]));
    }

    #[test]
    fn test_sources_check_clock_patch_fits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let config = SessionConfig {
            patch: true,
            ..SessionConfig::default()
        };
        let err = LoadSources::read(&entries, &config).unwrap_err();
        assert!(matches!(err, Error::Unsupported(ref m) if m.contains("tiny.bin")));
        assert!(LoadSources::read(&entries, &SessionConfig::default()).is_ok());
    }

    #[test]
    fn test_assemble_same_sources_for_each_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [0x42u8; 32]).unwrap();
        let entries = chain::parse(&path.display().to_string()).unwrap();
        let config = SessionConfig::default();
        let sources = LoadSources::read(&entries, &config).unwrap();
        let stubs = LoaderStubs::from_parts(Some(STUB.to_vec()), Some(STUB.to_vec()), Some(vec![0; 8]));

        let single = LoadPlan::assemble(&sources, &config, LoadStrategy::Single, 0, &stubs).unwrap();
        assert!(single.stage.is_none());
        assert_eq!(single.blocks[0].data, vec![0x42; 32]);

        let flash = LoadPlan::assemble(&sources, &config, LoadStrategy::SpiFlash, 0, &stubs).unwrap();
        assert_eq!(flash.blocks[0].data.len(), 8 + 4 + 32);
        assert_eq!(sources.files[0].image.data, vec![0x42; 32]);
    }
}

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rk_engine::source::{FileSource, SampleFormat, SampleSource, ToneSource};
use rk_engine::{
    Analyzer, AnalyzerConfig, CarrierControl, Channel, InspectorParams, InspectorMsgKind, Message,
};

pub struct Options {
    pub file: Option<PathBuf>,
    pub format: String,
    pub rate: f32,
    pub synth: bool,
    pub synth_baud: f32,
    pub synth_offset: f32,
    pub frequency: f32,
    pub bandwidth: f32,
    pub baud: f32,
    pub carrier: CarrierControl,
    pub sym_phase: f32,
    pub workers: usize,
    pub output: Option<PathBuf>,
    pub stats: bool,
}

/// Correlation id for the periodic info polls; everything else uses the
/// blocking calls' random ids.
const INFO_REQ_ID: u32 = 1;

fn build_source(opts: &Options) -> Result<Box<dyn SampleSource>, String> {
    if let Some(ref path) = opts.file {
        let format = match opts.format.as_str() {
            "ci8" => SampleFormat::Ci8,
            "ci16" => SampleFormat::Ci16,
            "cf32" => SampleFormat::Cf32,
            other => {
                return Err(format!(
                    "unknown sample format: {} (use ci8, ci16 or cf32)",
                    other
                ))
            }
        };
        Ok(Box::new(FileSource::new(
            path.to_string_lossy().to_string(),
            format,
            opts.rate,
        )))
    } else if opts.synth {
        Ok(Box::new(ToneSource::new(
            opts.rate,
            opts.synth_baud,
            opts.synth_offset,
        )))
    } else {
        Err("no input specified. Use -f <file> or --synth.".to_string())
    }
}

/// Run one inspector over the configured channel and stream its symbols.
pub fn run(opts: Options) -> Result<(), String> {
    let source = build_source(&opts)?;

    let analyzer = Analyzer::start(
        source,
        AnalyzerConfig {
            workers: opts.workers,
            ..AnalyzerConfig::default()
        },
    )?;

    // Ctrl-C ends the stream; the engine then delivers SourceEos.
    let stop = analyzer.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        stop.store(false, Ordering::Relaxed);
    })
    .map_err(|e| format!("failed to set Ctrl-C handler: {}", e))?;

    let channel = Channel {
        fc: opts.frequency,
        bw: opts.bandwidth,
    };
    let handle = analyzer.open(&channel)?;
    log::info!("inspector open on handle {}", handle);

    let params = InspectorParams {
        inspector_id: 1,
        fc_ctrl: opts.carrier,
        baud: opts.baud,
        sym_phase: opts.sym_phase,
        ..InspectorParams::default()
    };
    analyzer.set_params_async(handle, &params, 2);

    let mut writer = match opts.output {
        Some(ref path) => {
            let file = File::create(path)
                .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let mut total_symbols: u64 = 0;
    let mut total_batches: u64 = 0;
    let start = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_info = Instant::now();

    loop {
        let msg = analyzer.read();
        match msg {
            Message::Samples(batch) => {
                total_batches += 1;
                total_symbols += batch.samples.len() as u64;

                if let Some(ref mut w) = writer {
                    for s in &batch.samples {
                        let mut iq = [0u8; 8];
                        iq[..4].copy_from_slice(&s.re.to_le_bytes());
                        iq[4..].copy_from_slice(&s.im.to_le_bytes());
                        w.write_all(&iq)
                            .map_err(|e| format!("failed to write symbols: {}", e))?;
                    }
                }
            }
            Message::Inspector(resp) => match resp.kind {
                InspectorMsgKind::Info => {
                    log::info!(
                        "baud estimates: fac={:.1} Hz nln={:.1} Hz",
                        resp.baud.fac,
                        resp.baud.nln
                    );
                }
                InspectorMsgKind::Params => {}
                kind => log::warn!("unexpected control response: {:?}", kind),
            },
            Message::SourceEos => {
                log::info!("end of stream");
                break;
            }
            Message::Halt => break,
        }

        // Poll the estimators once a second
        if last_info.elapsed().as_secs() >= 1 {
            analyzer.get_info_async(handle, INFO_REQ_ID);
            last_info = Instant::now();
        }

        if opts.stats && last_stats.elapsed().as_secs() >= 5 {
            let elapsed = start.elapsed().as_secs_f64();
            eprintln!(
                "[{:.1}s] symbols: {} batches: {} ({:.0} sym/s)",
                elapsed,
                total_symbols,
                total_batches,
                total_symbols as f64 / elapsed,
            );
            last_stats = Instant::now();
        }
    }

    if opts.stats {
        let elapsed = start.elapsed().as_secs_f64();
        eprintln!(
            "done ({:.1}s): symbols: {} batches: {}",
            elapsed, total_symbols, total_batches,
        );
    }

    if let Some(mut w) = writer {
        w.flush().map_err(|e| format!("failed to flush output: {}", e))?;
    }

    // The source is gone; the close may find the inspector already reaped.
    let _ = analyzer.close(handle);
    analyzer.halt();

    Ok(())
}

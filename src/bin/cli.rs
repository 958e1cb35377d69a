use std::path::PathBuf;
use std::str::FromStr;

use burst_merge::{
    Denoise, Frame, MergeConfig, MergeError, MergeOutcome, MergeProgress, NoiseFunction,
    NoiseSource, TileSize,
};

const USAGE: &str = "usage: burst-merge --size WxH [--planes P] [--black B] [--white W] \
[--noise scale,offset ...] [--estimate-noise] [--tile 16|32|64] [--workers N] \
-o out.raw ref.raw alt.raw ...";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}\n{}", USAGE)]
    Usage(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug)]
struct Args {
    width: usize,
    height: usize,
    planes: usize,
    black_level: f32,
    white_level: f32,
    noise: NoiseSource,
    tile_size: Option<TileSize>,
    workers: usize,
    output: PathBuf,
    inputs: Vec<PathBuf>,
}

fn parse_value<T: FromStr>(flag: &str, value: Option<String>) -> Result<T, CliError> {
    let value = value.ok_or_else(|| CliError::Usage(format!("{flag} needs a value")))?;

    value
        .parse()
        .map_err(|_| CliError::Usage(format!("invalid value for {flag}: {value}")))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, CliError> {
    let mut size = None;
    let mut planes = 1;
    let mut black_level = 0.0;
    let mut white_level = u16::MAX as f32;
    let mut functions = Vec::new();
    let mut estimate = false;
    let mut tile_size = None;
    let mut workers = 0;
    let mut output = None;
    let mut inputs = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--size" => {
                let value: String = parse_value("--size", args.next())?;
                let (w, h) = value
                    .split_once('x')
                    .ok_or_else(|| CliError::Usage(format!("invalid size: {value}")))?;
                size = Some((
                    parse_value("--size", Some(w.to_string()))?,
                    parse_value("--size", Some(h.to_string()))?,
                ));
            }
            "--planes" => planes = parse_value("--planes", args.next())?,
            "--black" => black_level = parse_value("--black", args.next())?,
            "--white" => white_level = parse_value("--white", args.next())?,
            "--noise" => {
                let value: String = parse_value("--noise", args.next())?;
                let (scale, offset) = value
                    .split_once(',')
                    .ok_or_else(|| CliError::Usage(format!("invalid noise function: {value}")))?;

                // validity is checked by the merge, which falls back to uniform weighting
                functions.push(NoiseFunction {
                    scale: parse_value("--noise", Some(scale.to_string()))?,
                    offset: parse_value("--noise", Some(offset.to_string()))?,
                });
            }
            "--estimate-noise" => estimate = true,
            "--tile" => {
                tile_size = Some(match parse_value::<usize>("--tile", args.next())? {
                    16 => TileSize::Small,
                    32 => TileSize::Medium,
                    64 => TileSize::Large,
                    other => return Err(CliError::Usage(format!("unsupported tile size {other}"))),
                })
            }
            "--workers" => workers = parse_value("--workers", args.next())?,
            "-o" | "--output" => {
                let path: String = parse_value("-o", args.next())?;
                output = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Err(CliError::Usage(String::new())),
            flag if flag.starts_with('-') => {
                return Err(CliError::Usage(format!("unknown option {flag}")))
            }
            path => inputs.push(PathBuf::from(path)),
        }
    }

    let (width, height) = size.ok_or_else(|| CliError::Usage("--size is required".into()))?;
    let output = output.ok_or_else(|| CliError::Usage("-o is required".into()))?;

    if estimate && !functions.is_empty() {
        return Err(CliError::Usage(
            "--noise and --estimate-noise are exclusive".into(),
        ));
    }

    let noise = if estimate {
        NoiseSource::Estimate
    } else if functions.is_empty() {
        NoiseSource::Uniform
    } else {
        NoiseSource::Profile(functions)
    };

    Ok(Args {
        width,
        height,
        planes,
        black_level,
        white_level,
        noise,
        tile_size,
        workers,
        output,
        inputs,
    })
}

fn read_frame(path: &PathBuf, args: &Args) -> Result<Frame, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::Io {
        path: path.clone(),
        source,
    })?;

    Ok(Frame::from_ne_bytes(
        &bytes,
        args.width,
        args.height,
        args.planes,
        args.black_level,
        args.white_level,
    )?)
}

fn run() -> Result<(), CliError> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut config = MergeConfig::default().with_workers(args.workers);
    if let Some(tile_size) = args.tile_size {
        config = config.with_tile_size(tile_size);
    }

    let frames = args
        .inputs
        .iter()
        .map(|path| read_frame(path, &args))
        .collect::<Result<Vec<_>, _>>()?;

    let Some((reference, alternates)) = frames.split_first() else {
        return Err(MergeError::LessThanTwoImages(0).into());
    };

    let (tx, rx) = flume::unbounded();
    let listener = std::thread::spawn(move || {
        for event in rx.iter() {
            match event {
                MergeProgress::Stage(stage) => log::info!("{stage:?}"),
                MergeProgress::FrameAligned {
                    frame,
                    low_confidence,
                } => log::info!("aligned frame {frame} ({low_confidence} tiles on fallback)"),
                MergeProgress::TileMerged { done, total } if done == total => {
                    log::info!("merged {total} tiles")
                }
                _ => {}
            }
        }
    });

    let denoise = Denoise::new(config)?.with_progress(tx);
    let outcome = denoise.merge(reference, alternates, args.noise.clone());

    // closes the channel so the listener finishes
    drop(denoise);
    let _ = listener.join();

    let result = match outcome? {
        MergeOutcome::Completed(result) => result,
        MergeOutcome::Cancelled => return Ok(()),
    };

    for frame in &result.report.frames {
        log::info!(
            "frame {}: global ({:.2}, {:.2}), {} low confidence tiles, mean confidence {:.2}",
            frame.frame,
            frame.global_vector.dx,
            frame.global_vector.dy,
            frame.low_confidence_tiles,
            frame.mean_confidence
        );
    }

    let bytes = result
        .frame
        .to_ne_bytes(args.black_level, args.white_level)?;
    std::fs::write(&args.output, bytes).map_err(|source| CliError::Io {
        path: args.output.clone(),
        source,
    })?;

    log::info!("wrote {}", args.output.display());

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("burst-merge: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> impl Iterator<Item = String> + '_ {
        line.split_whitespace().map(String::from)
    }

    #[test]
    fn test_parse_full_command_line() {
        let parsed = parse_args(args(
            "--size 64x48 --planes 4 --black 64 --white 1023 --noise 1e-4,2e-6 \
             -o out.raw a.raw b.raw",
        ))
        .unwrap();

        assert_eq!((parsed.width, parsed.height, parsed.planes), (64, 48, 4));
        assert_eq!((parsed.black_level, parsed.white_level), (64.0, 1023.0));
        assert_eq!(parsed.inputs.len(), 2);
        assert!(matches!(parsed.noise, NoiseSource::Profile(ref f) if f.len() == 1));
    }

    #[test]
    fn test_parse_defaults_to_uniform_weighting() {
        let parsed = parse_args(args("--size 8x8 -o out.raw a.raw b.raw")).unwrap();

        assert_eq!(parsed.noise, NoiseSource::Uniform);
        assert_eq!(parsed.white_level, 65535.0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_args(args("-o out.raw a.raw")),
            Err(CliError::Usage(_))
        ));
        assert!(matches!(
            parse_args(args("--size 8by8 -o out.raw a.raw")),
            Err(CliError::Usage(_))
        ));
        assert!(matches!(
            parse_args(args("--size 8x8 --tile 48 -o out.raw a.raw")),
            Err(CliError::Usage(_))
        ));
        assert!(matches!(
            parse_args(args("--size 8x8 --noise 1,1 --estimate-noise -o o a b")),
            Err(CliError::Usage(_))
        ));
    }
}

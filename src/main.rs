use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use gait::c3d;
use gait::kinematics::AngleLayer;
use gait::model::lower_body_definition;
use gait::pipeline::{process_batch, BatchOutcome};
use gait::{EventConfig, FitConfig, GapConfig, Marker, Model, Reconstruction, ReconstructionConfig, Trial};

#[macro_use]
extern crate log;
extern crate simplelog;
use simplelog::*;

// =====================================================================
// Command line arguments.
// =====================================================================

#[derive(Parser, Debug, Clone)]
struct Args {
    // Single capture file
    #[arg(short, long, help = "C3D file to process.")]
    file: Option<String>,

    // All captures in a folder
    #[arg(
        short,
        long,
        env = "DATA_BASE_FOLDER",
        help = "Process every .c3d file in this folder (unless --file is given)."
    )]
    data_folder: Option<String>,

    #[arg(
        long,
        help = "Static trial for model calibration (default: the first input file)."
    )]
    static_trial: Option<String>,

    #[arg(
        short = 'o',
        long,
        help = "Output filename (auto-generated if unspecified, single file only)."
    )]
    fileout: Option<String>,

    #[clap(long, default_value_t = 10, help = "Longest gap (frames) to interpolate.")]
    max_gap: usize,

    #[clap(
        long,
        default_value_t = 0.10,
        help = "Largest unresolved share of a required marker."
    )]
    max_unresolved: f64,

    #[clap(long, default_value_t = 3, help = "Minimum visible markers per segment.")]
    min_markers: usize,

    #[clap(
        long,
        default_value_t = 10.0,
        help = "Fit residual (mm) above which a pose is low-confidence."
    )]
    residual: f64,

    #[clap(long, default_value_t = 100.0, help = "Heel-strike velocity threshold (mm/s).")]
    hs_velocity: f64,

    #[clap(long, default_value_t = 100.0, help = "Toe-off velocity threshold (mm/s).")]
    to_velocity: f64,

    #[clap(
        long,
        default_value_t = 0.6,
        help = "Minimum time (s) between events of the same kind."
    )]
    spacing: f64,

    #[clap(long, default_value_t = 1, help = "Trials processed in parallel.")]
    workers: usize,

    // Header output
    #[clap(long, action, help = "Print header info of the input files and exit.")]
    header_info: bool,

    // Marker export
    #[clap(
        long,
        action,
        help = "Write the marker positions of each input file as CSV and exit."
    )]
    markers_csv: bool,

    #[clap(long, action, help = "Do not output header row.")]
    noheader: bool,

    // Force overwrite of output
    #[clap(long, action, help = "Overwrite output if it exists.")]
    force: bool,

    // Extra output
    #[clap(long, short, action, help = "Produce superfluous output.")]
    verbose: bool,
}

impl Args {
    fn config(&self) -> ReconstructionConfig {
        ReconstructionConfig {
            gaps: GapConfig {
                max_fill_gap: self.max_gap,
                max_unresolved_fraction: self.max_unresolved,
            },
            fit: FitConfig {
                min_markers: self.min_markers,
                residual_threshold_mm: self.residual,
                ..Default::default()
            },
            events: EventConfig {
                heel_strike_velocity: self.hs_velocity,
                toe_off_velocity: self.to_velocity,
                min_event_spacing_s: self.spacing,
                ..Default::default()
            },
        }
    }
}

// =====================================================================
// Main.
// =====================================================================

/// Reconstructs joint angles and gait events for one or more C3D files.
///
/// Writes one tab-separated file of joint angles per trial, one row per
/// frame. Unresolved angles are left empty.
fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    CombinedLogger::init(vec![
        TermLogger::new(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto),
        WriteLogger::new(
            level,
            Config::default(),
            OpenOptions::new()
                .create(true) // To allow creating the file, if it doesn't exist,
                .append(true) // do not truncate the file, but instead add to it.
                .open("gait.log")?,
        ),
    ])?;
    info!("{:?}", args);

    let files = input_files(&args)?;
    if files.is_empty() {
        error!("Error: no .c3d files found!");
        std::process::exit(2);
    }
    if args.fileout.is_some() && files.len() > 1 {
        error!("Error: --fileout needs a single input file.");
        std::process::exit(1);
    }

    if args.header_info {
        for filename in &files {
            let info = c3d::inspect(filename)?;
            println!(
                "{}\t{}\t{}\t{}\t{:.1}",
                filename.display(),
                info.header.first_frame,
                info.frame_count()?,
                info.point_count()?,
                info.frame_rate()?
            );
        }
        return Ok(());
    }

    if args.markers_csv {
        return export_markers(&files, &args);
    }

    let static_file = match &args.static_trial {
        Some(s) => PathBuf::from(s),
        None => files[0].clone(),
    };
    info!("Calibrating model on {}", static_file.display());
    let model = Model::calibrate(&lower_body_definition(), &c3d::read_file(&static_file)?)?;

    let time_start = Instant::now();
    let outcomes = process_batch(&files, &model, &args.config(), args.workers);
    let time_duration = time_start.elapsed().as_millis() + 1; // Add one to avoid division by zero.
    info!("Ready, {} trials (in {} ms)", outcomes.len(), time_duration);

    let failed = write_outcomes(outcomes, &args);
    if failed > 0 {
        return Err(eyre!("{} of {} trials failed", failed, files.len()));
    }

    Ok(())
}

/// Writes the angle table of every successful outcome. Returns how many
/// trials failed, in processing or in writing.
fn write_outcomes(outcomes: Vec<BatchOutcome>, args: &Args) -> usize {
    let mut failed = 0;
    for outcome in outcomes {
        let reconstruction = match outcome.result {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {}", outcome.path.display(), e);
                failed += 1;
                continue;
            }
        };
        let out_filename = match &args.fileout {
            Some(f) => f.clone(),
            None => create_outputfilename(&outcome.path.to_string_lossy(), "_kin.tsv"),
        };
        if !args.force && Path::new(&out_filename).exists() {
            error!("Error: {} exists! Use --force to overwrite.", out_filename);
            failed += 1;
            continue;
        }
        if let Err(e) = write_angles(&reconstruction, &out_filename, !args.noheader) {
            error!("{}: {}", out_filename, e);
            failed += 1;
            continue;
        }
        info!("Wrote {}", out_filename);
        log_events(&reconstruction);
        if args.verbose {
            for warning in reconstruction.diagnostics() {
                println!("{}", warning);
            }
        }
    }
    failed
}

/// The single `--file`, or every `.c3d` file in the data folder, sorted.
fn input_files(args: &Args) -> Result<Vec<PathBuf>> {
    if let Some(f) = &args.file {
        return Ok(vec![PathBuf::from(f)]);
    }
    let folder = args
        .data_folder
        .as_ref()
        .ok_or_else(|| eyre!("Give --file or --data-folder (or set DATA_BASE_FOLDER)."))?;
    let mut files: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("c3d"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Prints the column names for one joint.
fn emit_header(out: &mut impl Write, joint: &str, components: &[&str; 3]) -> std::io::Result<()> {
    for (i, c) in components.iter().enumerate() {
        if i > 0 {
            write!(out, "\t")?;
        }
        write!(out, "{}_{}", joint, c)?;
    }
    Ok(())
}

fn write_angles(reconstruction: &Reconstruction, filename: &str, header: bool) -> Result<()> {
    let angles: &AngleLayer = reconstruction
        .angles()
        .ok_or_else(|| eyre!("no joint angles reconstructed"))?;
    let trial = reconstruction.trial();
    let mut out = BufWriter::new(File::create(filename)?);

    if header {
        write!(out, "Frame\tTime")?;
        for series in angles.series() {
            write!(out, "\t")?;
            emit_header(&mut out, &series.joint, &series.components)?;
        }
        writeln!(out)?;
    }

    for frame in trial.frames() {
        write!(
            out,
            "{}\t{:.3}",
            trial.metadata.first_frame + frame.index,
            frame.timestamp
        )?;
        for series in angles.series() {
            match series.angle(frame.index) {
                Some(a) => write!(out, "\t{:.2}\t{:.2}\t{:.2}", a[0], a[1], a[2])?,
                None => write!(out, "\t\t\t")?,
            }
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes `<name>_markers.csv` for every input file.
fn export_markers(files: &[PathBuf], args: &Args) -> Result<()> {
    let mut failed = 0;
    for filename in files {
        let out_filename = match &args.fileout {
            Some(f) => f.clone(),
            None => create_outputfilename(&filename.to_string_lossy(), "_markers.csv"),
        };
        if !args.force && Path::new(&out_filename).exists() {
            error!("Error: {} exists! Use --force to overwrite.", out_filename);
            failed += 1;
            continue;
        }
        let written = c3d::read_file(filename)
            .map_err(|e| eyre!(e))
            .and_then(|trial| {
                let mut out = BufWriter::new(File::create(&out_filename)?);
                write_markers_csv(&mut out, &trial, !args.noheader)?;
                out.flush()?;
                Ok(())
            });
        match written {
            Ok(()) => info!("Wrote {}", out_filename),
            Err(e) => {
                error!("{}: {}", filename.display(), e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(eyre!("{} of {} files failed", failed, files.len()));
    }
    Ok(())
}

/// Raw marker positions (mm), three columns per known marker in label-set
/// order. Markers the capture lacks, and gaps, are `NaN`.
fn write_markers_csv(out: &mut impl Write, trial: &Trial, header: bool) -> std::io::Result<()> {
    if header {
        let names: Vec<String> = Marker::ALL
            .iter()
            .map(|m| format!("{0}_X,{0}_Y,{0}_Z", m))
            .collect();
        writeln!(out, "{}", names.join(","))?;
    }
    let columns: Vec<Option<usize>> = Marker::ALL
        .iter()
        .map(|&m| trial.markers().index_of(m))
        .collect();
    for frame in trial.frames() {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                write!(out, ",")?;
            }
            match column.and_then(|c| frame.position(c)) {
                Some(p) => write!(out, "{:.3},{:.3},{:.3}", p.x, p.y, p.z)?,
                None => write!(out, "NaN,NaN,NaN")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

fn log_events(reconstruction: &Reconstruction) {
    let Some(events) = reconstruction.events() else {
        return;
    };
    for limb in events.limbs() {
        info!(
            "{:?} ({}): {} events",
            limb.limb,
            limb.source,
            limb.events.len()
        );
        for e in &limb.events {
            debug!("{:?}\t{}\t{}\t{:.3}", e.limb, e.kind, e.frame, e.timestamp);
        }
    }
}

/// Create a new output filename, tries to replace ".c3d" with `suffix`,
/// e.g. "_kin.tsv".
///
/// Short input filenames will return `output` followed by `suffix`.
///
fn create_outputfilename(filename: &str, suffix: &str) -> String {
    let len = filename.len();
    if len > 4 {
        let ext = filename.get(len - 4..len).unwrap_or("");
        if ext.eq_ignore_ascii_case(".c3d") {
            format!("{}{}", &filename[0..len - 4], suffix)
        } else {
            format!("{}{}", &filename, suffix)
        }
    } else {
        format!("output{}", suffix)
    }
}

// =====================================================================
// Tests.
// =====================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gait::{Position, TrialMetadata};

    #[test]
    fn filename_normal() {
        let result = create_outputfilename("walk01.c3d", "_kin.tsv");
        assert!(result == "walk01_kin.tsv");
    }

    #[test]
    fn filename_upper_case() {
        let result = create_outputfilename("walk01.C3D", "_kin.tsv");
        assert!(result == "walk01_kin.tsv");
    }

    #[test]
    fn filename_short() {
        let result = create_outputfilename("", "_kin.tsv");
        assert!(result == "output_kin.tsv");
    }

    #[test]
    fn filename_four_chars() {
        let result = create_outputfilename("abcd", "_kin.tsv");
        assert!(result == "output_kin.tsv");
    }

    #[test]
    fn filename_five_chars() {
        let result = create_outputfilename("a.c3d", "_kin.tsv");
        assert!(result == "a_kin.tsv");
    }

    #[test]
    fn filename_no_c3d() {
        let result = create_outputfilename("abcde", "_kin.tsv");
        assert!(result == "abcde_kin.tsv");
    }

    #[test]
    fn header_names_components() {
        let mut out = Vec::new();
        emit_header(&mut out, "LKnee", &["flexion", "adduction", "internal_rotation"]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "LKnee_flexion\tLKnee_adduction\tLKnee_internal_rotation"
        );
    }

    #[test]
    fn filename_markers_csv() {
        let result = create_outputfilename("data/walk01.c3d", "_markers.csv");
        assert!(result == "data/walk01_markers.csv");
    }

    #[test]
    fn markers_csv_fills_missing_with_nan() {
        let labels = vec![
            "pilot:LHEE".to_string(),
            "Extra".to_string(),
            "MomentumHealth:RASI".to_string(),
        ];
        let rows = vec![
            vec![Some(Position::new(1.0, 2.0, 3.0)), Some(Position::zeros()), Some(Position::new(4.0, 5.0, 6.0))],
            vec![None, None, Some(Position::new(7.0, 8.0, 9.5))],
        ];
        let trial = Trial::new(TrialMetadata::default(), 100.0, labels, rows).unwrap();
        let mut out = Vec::new();
        write_markers_csv(&mut out, &trial, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<Vec<&str>> = text.lines().map(|l| l.split(',').collect()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.len() == 3 * Marker::ALL.len()));
        assert_eq!(lines[0][0], format!("{}_X", Marker::ALL[0]));

        let col = |m: Marker| 3 * Marker::ALL.iter().position(|&x| x == m).unwrap();
        let lhee = col(Marker::Lhee);
        let rasi = col(Marker::Rasi);
        assert_eq!(lines[0][lhee], "LHEE_X");
        assert_eq!(&lines[1][lhee..lhee + 3], &["1.000", "2.000", "3.000"]);
        assert_eq!(&lines[2][lhee..lhee + 3], &["NaN", "NaN", "NaN"]);
        assert_eq!(&lines[2][rasi..rasi + 3], &["7.000", "8.000", "9.500"]);
        assert_eq!(&lines[1][col(Marker::C7)..col(Marker::C7) + 3], &["NaN", "NaN", "NaN"]);

        let mut out = Vec::new();
        write_markers_csv(&mut out, &trial, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[test]
    fn write_failure_does_not_stop_later_trials() {
        let dir = std::env::temp_dir().join(format!("gait-main-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let trial = || Trial::new(TrialMetadata::default(), 100.0, vec![], vec![vec![]; 3]).unwrap();
        let model = Model::new(vec![], vec![], vec![]).unwrap();
        let config = ReconstructionConfig::default();
        let outcome = |path: PathBuf| BatchOutcome {
            path,
            result: gait::reconstruct(trial(), &model, &config),
        };
        let unwritable = dir.join("no-such-folder").join("first.c3d");
        let good = dir.join("second.c3d");
        let args = Args::parse_from(["gait-reconstruct", "--force"]);

        let failed = write_outcomes(vec![outcome(unwritable), outcome(good)], &args);
        assert!(failed == 1);
        let written = fs::read_to_string(dir.join("second_kin.tsv")).unwrap();
        assert!(written.lines().count() == 4);
        assert!(written.starts_with("Frame\tTime"));
        fs::remove_dir_all(&dir).unwrap();
    }
}

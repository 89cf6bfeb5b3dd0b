//! Volume reconstruction CLI - reconstruct a volume from a recorded sweep.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use sonovol::{
    recon::VolumeReconstructor,
    schema::{ReconstructionConfig, TransformRepository},
    sequence::{SequenceReadOptions, SequenceReader},
};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--example" {
        print_example_config();
        return ExitCode::SUCCESS;
    }

    if args.len() < 4 {
        eprintln!("Usage: {} <config.json> <input.mha> <output.mha>", args[0]);
        eprintln!();
        eprintln!("Reconstruct a volume from a tracked-frame sequence file.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Reconstruction configuration");
        eprintln!("  input.mha    Recorded tracked-frame sequence (.mha or .mhd)");
        eprintln!("  output.mha   Destination for the reconstructed volume");
        eprintln!();
        eprintln!("An example configuration is printed with --example.");
        return ExitCode::FAILURE;
    }

    let config_path = PathBuf::from(&args[1]);
    let input_path = PathBuf::from(&args[2]);
    let output_path = PathBuf::from(&args[3]);

    let config_str = match std::fs::read_to_string(&config_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading config file: {e}");
            return ExitCode::FAILURE;
        }
    };
    let config: ReconstructionConfig = match serde_json::from_str(&config_str) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error parsing config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(config, &input_path, &output_path) {
        eprintln!("Reconstruction failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(
    config: ReconstructionConfig,
    input: &PathBuf,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let auto_extent = config.output_extent.is_none() || config.output_origin.is_none();
    let mut reconstructor = VolumeReconstructor::new(config)?;
    let mut repository = TransformRepository::new();

    let start = Instant::now();
    let reader = SequenceReader::read(input, SequenceReadOptions::default())?;
    println!(
        "Loaded {} frames of {}x{} from {}",
        reader.frame_count(),
        reader.dimensions()[0],
        reader.dimensions()[1],
        input.display()
    );

    if auto_extent {
        reconstructor.set_output_extent_from_frame_list(reader.frames(), &mut repository)?;
    }
    let extent = reconstructor
        .output_extent()
        .unwrap_or([0, 0, 0, 0, 0, 0]);
    println!(
        "Output extent: {}x{}x{} voxels",
        extent[1] - extent[0] + 1,
        extent[3] - extent[2] + 1,
        extent[5] - extent[4] + 1
    );

    for frame in reader.frames() {
        reconstructor.add_tracked_frame(frame, &mut repository)?;
    }
    println!(
        "Inserted {} frames ({} skipped for invalid tracking) in {:.2?}",
        reconstructor.inserted_frame_count(),
        reconstructor.skipped_invalid_count(),
        start.elapsed()
    );

    reconstructor.save_reconstructed_volume(output, false, true)?;
    println!("Saved reconstructed volume to {}", output.display());
    Ok(())
}

fn print_example_config() {
    let example = ReconstructionConfig {
        output_spacing: [0.5, 0.5, 0.5],
        ..Default::default()
    };
    match serde_json::to_string_pretty(&example) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error serializing example config: {e}"),
    }
}

//! ALICE-Guess CLI
//!
//! Command-line interface for training a reference model, enumerating guesses and
//! estimating guess numbers.

use alice_guess::{
    AlphabetReducer, CharacterCounter, ConfigFile, GuessConfig, Guesser, NgramArchitecture,
    NgramOracle, PasswordFormat, PasswordList, SerializationMethod,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::LevelFilter;
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "alice-guess")]
#[command(author = "Moroya Sakamoto")]
#[command(version = "1.0.0")]
#[command(about = "Password guess enumeration and guess-number estimation")]
#[command(long_about = r#"
ALICE-Guess: Probabilistic Password Guessing

Principle:
  Password corpus → Character model P(next|context)
    → Enumerate: every guess above a probability floor, most likely first
    → Estimate:  guess number of a test password from sampled random walks

The guess number of p is the count of strings at least as likely as p.
"#)]
struct Cli {
    /// Log level: debug, info, warning, error
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the n-gram reference model
    Train {
        /// Password files (repeatable)
        #[arg(long = "pwd-file", required = true)]
        pwd_file: Vec<PathBuf>,

        /// Password file format: list, tsv
        #[arg(long, default_value = "list")]
        pwd_format: String,

        /// Architecture file to write
        #[arg(long)]
        arch_file: PathBuf,

        /// Weight file to write
        #[arg(long)]
        weight_file: PathBuf,

        /// Config file ({"args": ..., "config": ...})
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Enumerate guesses or estimate guess numbers as configured
    Guess {
        /// Config file ({"args": ..., "config": ...})
        #[arg(long)]
        config_args: PathBuf,

        /// Output file (- for stdout), overrides args.enumerate_ofile
        #[arg(long)]
        enumerate_ofile: Option<PathBuf>,

        /// Overrides args.arch_file
        #[arg(long)]
        arch_file: Option<PathBuf>,

        /// Overrides args.weight_file
        #[arg(long)]
        weight_file: Option<PathBuf>,
    },

    /// Print the model probability of passwords
    Score {
        #[arg(long)]
        arch_file: PathBuf,

        #[arg(long)]
        weight_file: PathBuf,

        /// Config file ({"args": ..., "config": ...})
        #[arg(long)]
        config: Option<PathBuf>,

        /// Passwords to score
        #[arg(required = true)]
        passwords: Vec<String>,
    },

    /// Show model information
    Info {
        #[arg(long)]
        arch_file: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            pwd_file,
            pwd_format,
            arch_file,
            weight_file,
            config,
        } => {
            init_logging(cli.log_level.as_deref(), cli.log_file.as_deref())?;
            let format: PasswordFormat = pwd_format.parse()?;
            train(&pwd_file, format, &arch_file, &weight_file, config.as_deref())?;
        }
        Commands::Guess {
            config_args,
            enumerate_ofile,
            arch_file,
            weight_file,
        } => {
            let mut file = ConfigFile::from_path(&config_args)?;
            let level = cli.log_level.or_else(|| file.args.log_level.clone());
            let log_file = cli.log_file.or_else(|| file.args.log_file.clone());
            init_logging(level.as_deref(), log_file.as_deref())?;

            if enumerate_ofile.is_some() {
                file.args.enumerate_ofile = enumerate_ofile;
            }
            if arch_file.is_some() {
                file.args.arch_file = arch_file;
            }
            if weight_file.is_some() {
                file.args.weight_file = weight_file;
            }
            guess(file)?;
        }
        Commands::Score {
            arch_file,
            weight_file,
            config,
            passwords,
        } => {
            init_logging(cli.log_level.as_deref(), cli.log_file.as_deref())?;
            score(&arch_file, &weight_file, config.as_deref(), &passwords)?;
        }
        Commands::Info { arch_file } => {
            init_logging(cli.log_level.as_deref(), cli.log_file.as_deref())?;
            show_info(&arch_file)?;
        }
    }

    Ok(())
}

fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter = match level.unwrap_or("info").to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => return Err(format!("unknown log level '{}'", other).into()),
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(filter);
    if let Some(path) = log_file {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<GuessConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => ConfigFile::from_path(path)?.config,
        None => GuessConfig::default(),
    })
}

/// Architecture, reducer and weights, with the model's alphabet forced onto `config`
fn load_model(
    arch_file: &Path,
    weight_file: &Path,
    config: &mut GuessConfig,
) -> Result<(AlphabetReducer, NgramOracle), Box<dyn Error>> {
    let arch = NgramArchitecture::load(arch_file)?;
    arch.apply_to(config);
    let reducer = arch.reducer();
    let oracle = NgramOracle::load_weights(weight_file)?;
    log::info!(
        "Loaded order-{} model ({} working symbols) from {}",
        oracle.order(),
        reducer.alphabet().len(),
        weight_file.display()
    );
    Ok((reducer, oracle))
}

fn train(
    pwd_files: &[PathBuf],
    format: PasswordFormat,
    arch_file: &Path,
    weight_file: &Path,
    config: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let config = load_config(config)?;
    log::info!("Configuration: {}", serde_json::to_string(&config)?);

    let mut counter = CharacterCounter::new(&config.char_bag, config.min_len, config.max_len);
    let list = PasswordList::concat(pwd_files, format)?.filtered(&mut counter);
    if list.is_empty() {
        return Err("no password passed the character bag and length filter".into());
    }

    let reducer = AlphabetReducer::build(&config.char_bag, &config.reducer_settings(), &counter);
    let model = NgramOracle::fit(&list, &reducer, config.context_length, config.train_backwards)?;

    NgramArchitecture::new(&config, &counter).save(arch_file)?;
    model.save_weights(weight_file)?;

    println!("Trained:      {} passwords", list.len());
    println!("Filtered out: {}", counter.filtered_out());
    println!(
        "Alphabet:     {} characters -> {} symbols",
        reducer.original_chars().len(),
        reducer.alphabet().len()
    );
    println!("Contexts:     {}", model.context_count());
    println!("Time:         {:.2?}", start.elapsed());
    Ok(())
}

fn guess(file: ConfigFile) -> Result<(), Box<dyn Error>> {
    let ConfigFile { args, mut config } = file;
    log::info!(
        "Configuration: {}",
        serde_json::to_string(&ConfigFile {
            args: args.clone(),
            config: config.clone(),
        })?
    );

    let arch_file = args.arch_file.clone().ok_or("args.arch_file is required")?;
    let weight_file = args.weight_file.clone().ok_or("args.weight_file is required")?;
    let (reducer, oracle) = load_model(&arch_file, &weight_file, &mut config)?;

    let cancel = AtomicBool::new(false);
    let guesser = Guesser::new(&oracle, &reducer, &config)?;
    let summary = guesser.run(&args, &cancel)?;

    eprintln!(
        "Wrote {} records in {:.2}s",
        summary.records_written, summary.elapsed_secs
    );
    Ok(())
}

fn score(
    arch_file: &Path,
    weight_file: &Path,
    config: Option<&Path>,
    passwords: &[String],
) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(config)?;
    config.guess_serialization_method = SerializationMethod::Human;
    let (reducer, oracle) = load_model(arch_file, weight_file, &mut config)?;

    let guesser = Guesser::new(&oracle, &reducer, &config)?;
    for (password, scored) in passwords.iter().zip(guesser.score(passwords)?) {
        match scored {
            Ok(log_prob) => println!("{}\t{:e}", password, log_prob.exp()),
            Err(failure) => println!("{}\t0\t{}", password, failure),
        }
    }
    Ok(())
}

fn show_info(arch_file: &Path) -> Result<(), Box<dyn Error>> {
    let arch = NgramArchitecture::load(arch_file)?;
    let reducer = arch.reducer();

    println!("ALICE-Guess Model Info");
    println!("======================");
    println!("Model type:       {}", arch.model_type);
    println!("Context length:   {}", arch.context_length);
    println!("Length range:     {}..={}", arch.min_len, arch.max_len);
    println!("Backwards:        {}", arch.train_backwards);
    println!("Character bag:    {} characters", reducer.original_chars().len());
    println!("Working alphabet: {} symbols", reducer.alphabet().len());
    for class in reducer.rare_classes() {
        let members: String = class.members.iter().map(|&(c, _)| c).collect();
        println!("  rare class {:?}: {}", class.representative, members);
    }
    println!("Trained on:       {} passwords", arch.trained_passwords);
    println!("Created:          {}", arch.created_at);
    Ok(())
}

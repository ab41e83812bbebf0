//! Walks through training a multi-layer perceptron on MNIST using the library provided
//! by `digit_mlp`: losses, autograd, gradients, an optimizer step and finally a few epochs
//! of training followed by a classification of a test digit.
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- -h
//! cargo run --release
//! cargo run --release -- --stage autograd
//! ```
//!
//! MNIST is downloaded into `--data-dir` unless it is already there.

use std::{
    error::Error,
    fmt::{self, Display},
    fs,
    path::PathBuf,
};

use digit_mlp::{
    datasets::{IMAGE_PIXELS, N_CLASSES, load_mnist},
    loss::{CrossEntropyLoss, NLLLoss},
    nn::{Head, Module, mlp},
    optim::SGD,
    plot::{plot_losses, view_classify},
    trainer::{TrainConfig, accuracy, predict_proba, train},
    walkthrough::{autograd_demo, gradient_demo, loss_of_untrained, optimizer_step_demo},
};

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Which part of the walkthrough to run
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
enum Stage {
    All,
    Loss,
    Autograd,
    Gradient,
    Step,
    Train,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::All => write!(f, "all"),
            Stage::Loss => write!(f, "loss"),
            Stage::Autograd => write!(f, "autograd"),
            Stage::Gradient => write!(f, "gradient"),
            Stage::Step => write!(f, "step"),
            Stage::Train => write!(f, "train"),
        }
    }
}

impl Stage {
    fn runs(self, stage: Stage) -> bool {
        self == Stage::All || self == stage
    }
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Stage::All)]
    stage: Stage,
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    /// Fail instead of downloading MNIST when it is missing from `data_dir`
    #[clap(long, default_value_t = false)]
    no_download: bool,
    #[clap(long, default_value_t = 60_000)]
    train_size: usize,
    #[clap(long, default_value_t = 10_000)]
    test_size: usize,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 5)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.003)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.0)]
    momentum: f32,
    #[clap(long, default_value_t = 0.0)]
    weight_decay: f32,
    /// Learning rate of the single step demonstration
    #[clap(long, default_value_t = 0.01)]
    step_lr: f32,
    #[clap(long, value_delimiter = ',', default_values_t = vec![128, 64])]
    hidden_units: Vec<usize>,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
    /// Seeds weight initialization and shuffling
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long, default_value_t = false)]
    no_plot: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(rand::random);
    log::info!("seed: {}", seed);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    if args.stage.runs(Stage::Autograd) {
        autograd_demo(&mut rng)?;
        if args.stage == Stage::Autograd {
            return Ok(());
        }
    }

    let mnist = load_mnist(
        &args.data_dir,
        args.train_size,
        args.test_size,
        !args.no_download,
    )?;
    log::info!(
        "{} training and {} test images",
        mnist.train.len(),
        mnist.test.len()
    );
    let test = mnist.test;
    let train_loader = mnist.train.into_loader(args.batch_size, true)?;
    let (images, labels) = train_loader
        .seeded_iter(seed)
        .next()
        .ok_or("the training set is empty")?;
    log::info!("batch of images with shape {:?}", images.shape());

    if args.stage.runs(Stage::Loss) {
        let model = mlp(IMAGE_PIXELS, &args.hidden_units, N_CLASSES, Head::Logits, &mut rng);
        log::info!("{}", model);
        loss_of_untrained(&model, &CrossEntropyLoss, &images, &labels)?;

        let model = mlp(IMAGE_PIXELS, &args.hidden_units, N_CLASSES, Head::LogSoftmax, &mut rng);
        log::info!("{}", model);
        loss_of_untrained(&model, &NLLLoss, &images, &labels)?;
    }

    if args.stage.runs(Stage::Gradient) {
        let model = mlp(IMAGE_PIXELS, &args.hidden_units, N_CLASSES, Head::LogSoftmax, &mut rng);
        gradient_demo(&model, &NLLLoss, &images, &labels)?;
    }

    if args.stage.runs(Stage::Step) {
        let model = mlp(IMAGE_PIXELS, &args.hidden_units, N_CLASSES, Head::LogSoftmax, &mut rng);
        optimizer_step_demo(&model, &NLLLoss, &images, &labels, args.step_lr)?;
    }

    if args.stage.runs(Stage::Train) {
        let model = mlp(IMAGE_PIXELS, &args.hidden_units, N_CLASSES, Head::LogSoftmax, &mut rng);
        log::info!("{}", model);
        let mut optim = SGD::new(model.parameters(), args.lr)
            .momentum(args.momentum)
            .weight_decay(args.weight_decay);
        log::info!(
            "Training for {} epochs with learning rate {}",
            args.epochs,
            optim.lr()
        );
        let config = TrainConfig {
            epochs: args.epochs,
            seed: args.seed,
        };
        let losses = train(&model, &NLLLoss, &mut optim, &train_loader, &config)?;

        let (image, label) = match test.image(0) {
            Some(image) => (image.to_vec(), test.labels[0]),
            None => {
                let (image, label) = train_loader.sample(0).ok_or("the training set is empty")?;
                (image.to_vec(), label)
            }
        };
        if !test.is_empty() {
            let test_loader = test.into_loader(args.batch_size, false)?;
            log::info!("Test accuracy: {:.4}", accuracy(&model, &test_loader)?);
        }

        let probs = predict_proba(&model, Head::LogSoftmax, &image)?;
        let predicted = probs
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0;
        log::info!("Digit {} classified as {} with probabilities {:?}", label, predicted, probs);

        if !args.no_plot {
            fs::create_dir_all(&args.output_dir)?;
            plot_losses(&losses, &format!("{}/training_loss.png", args.output_dir))?;
            view_classify(&image, &probs, &format!("{}/classify_digit_{}.png", args.output_dir, label))?;
        }
    }

    Ok(())
}

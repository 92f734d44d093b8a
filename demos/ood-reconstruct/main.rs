// Reconstruction based out-of-distribution scoring with a DDPM.
//
// The input image is noised to each of the requested timesteps, reconstructed with the
// reverse diffusion process and the pixel reconstruction error gets reported. Without an
// input image a seeded standard normal image is used. With --generate, samples are drawn
// from the model instead.
//
// The UNet weights have to be converted to a .safetensors or .ot file first, the
// variable names follow the layout of `UNet2DModel`.
use clap::Parser;
use ddpm_ood::{models::unet_2d, pipelines, schedulers::ddpm, utils::ExecutionContext};
use tch::{Device, Kind, Tensor};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The input image, converted to grayscale and resized to the model resolution.
    #[arg(long, value_name = "FILE")]
    input_image: Option<String>,

    /// When set, use the CPU for the listed devices, can be 'all', 'unet', etc.
    /// Multiple values can be set.
    #[arg(long)]
    cpu: Vec<String>,

    /// The UNet weight file, in .safetensors or .ot format.
    #[arg(long, value_name = "FILE")]
    unet_weights: Option<String>,

    /// Run with randomly initialized weights when no weight file is given.
    #[arg(long)]
    random_weights: bool,

    /// The timesteps the input image gets noised to.
    #[arg(long, value_delimiter = ',', default_values_t = [100, 250, 500])]
    timesteps: Vec<usize>,

    /// The random seed to be used for the noise.
    #[arg(long, default_value_t = 32)]
    seed: i64,

    /// Generate this many samples rather than scoring an image.
    #[arg(long)]
    generate: Option<usize>,

    /// The name of the generated images.
    #[arg(long, value_name = "FILE", default_value = "ddpm_sample.png")]
    final_image: String,
}

fn image_preprocess<T: AsRef<std::path::Path>>(path: T, size: i64) -> anyhow::Result<Tensor> {
    let image = tch::vision::image::load(path)?;
    let image = tch::vision::image::resize(&image, size, size)?;
    let image = image.to_kind(Kind::Float).mean_dim([0i64].as_slice(), true, Kind::Float);
    Ok((image / 255. * 2. - 1.).unsqueeze(0))
}

fn save_samples(samples: &Tensor, final_image: &str) -> anyhow::Result<()> {
    let (num_samples, _, _, _) = samples.size4()?;
    let samples = ((samples + 1.) / 2.).clamp(0., 1.).to_device(Device::Cpu);
    let samples = (samples * 255.).to_kind(Kind::Uint8);
    for idx in 0..num_samples {
        let final_image = if num_samples > 1 {
            match final_image.rsplit_once('.') {
                None => format!("{}.{}.png", final_image, idx + 1),
                Some((filename_no_extension, extension)) => {
                    format!("{}.{}.{}", filename_no_extension, idx + 1, extension)
                }
            }
        } else {
            final_image.to_string()
        };
        tch::vision::image::save(&samples.get(idx).repeat([3, 1, 1]), &final_image)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let Args {
        input_image,
        cpu,
        unet_weights,
        random_weights,
        timesteps,
        seed,
        generate,
        final_image,
    } = Args::parse();
    if unet_weights.is_none() && !random_weights {
        anyhow::bail!("no --unet-weights given, pass --random-weights to run without any")
    }
    tch::maybe_init_cuda();
    let ctx = ExecutionContext::new(cpu).with_seed(seed);
    tracing::info!(device = ?ctx.device("unet"), "building the unet");
    let unet = pipelines::build_unet(unet_2d::UNet2DModelConfig::default(), unet_weights, &ctx)?;
    let config = ddpm::DDPMConfig::default();
    let image_size = config.image_size;
    let process = pipelines::build_process(unet, config, &ctx)?;

    if let Some(num_samples) = generate {
        ctx.manual_seed(0);
        tracing::info!(num_samples, "generating");
        let samples = process.generate(num_samples)?;
        return save_samples(&samples, &final_image);
    }

    let image = match input_image {
        Some(input_image) => image_preprocess(input_image, image_size)?,
        None => {
            ctx.manual_seed(0);
            Tensor::randn([1, 1, image_size, image_size], (Kind::Float, Device::Cpu))
        }
    };
    let image = image.to_device(process.device());
    for t in timesteps {
        ctx.manual_seed(t as i64);
        let (noised, _noise) = process.corrupt(&image, t)?;
        let reconstruction = process.denoise(&noised, t)?;
        let mse = (&reconstruction - &image).square().mean(Kind::Float).double_value(&[]);
        tracing::info!(timestep = t, mse, "reconstructed");
    }
    Ok(())
}

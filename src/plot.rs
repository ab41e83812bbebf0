//! Plots a digit next to the predicted class probabilities, and training loss curves

use std::error::Error;

use plotters::prelude::*;

use crate::datasets::{IMAGE_COLS, IMAGE_PIXELS, IMAGE_ROWS, MEAN, STD, denormalize};

/// Renders a normalized MNIST image on the left and a horizontal bar chart of the class
/// probabilities `probs` on the right
pub fn view_classify(image: &[f32], probs: &[f32], file_name: &str) -> Result<(), Box<dyn Error>> {
    if image.len() != IMAGE_PIXELS {
        return Err(format!(
            "expected an image of {} pixels, got {}",
            IMAGE_PIXELS,
            image.len()
        )
        .into());
    }
    let intensities = denormalize(image, MEAN, STD);

    let root_area = BitMapBackend::new(file_name, (900, 450)).into_drawing_area();
    root_area.fill(&WHITE)?;
    let (image_area, bar_area) = root_area.split_horizontally(450);

    let rows = IMAGE_ROWS as i32;
    let cols = IMAGE_COLS as i32;
    let mut image_chart = ChartBuilder::on(&image_area)
        .margin(20)
        .build_cartesian_2d(0..cols, 0..rows)?;
    // row 0 is the top of the image
    image_chart.draw_series((0..rows).flat_map(|r| (0..cols).map(move |c| (r, c))).map(
        |(r, c)| {
            let shade = (intensities[(r * cols + c) as usize] * 255.0) as u8;
            Rectangle::new(
                [(c, rows - r), (c + 1, rows - r - 1)],
                RGBColor(shade, shade, shade).filled(),
            )
        },
    ))?;

    let n_classes = probs.len() as i32;
    let mut bar_chart = ChartBuilder::on(&bar_area)
        .caption("Class Probability", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(0f32..1.1f32, (0..n_classes).into_segmented())?;
    bar_chart
        .configure_mesh()
        .disable_y_mesh()
        .y_labels(probs.len())
        .draw()?;
    bar_chart.draw_series(
        Histogram::horizontal(&bar_chart)
            .style(BLUE.filled())
            .margin(5)
            .data(probs.iter().enumerate().map(|(i, p)| (i as i32, *p))),
    )?;

    root_area.present()?;
    log::info!("Classification plot saved to '{}'.", file_name);
    Ok(())
}

/// Plots the mean training loss of every epoch
pub fn plot_losses(losses: &[f32], file_name: &str) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let max_loss = losses.iter().copied().fold(0.0f32, f32::max);
    let mut chart = ChartBuilder::on(&root_area)
        .caption("Training loss", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(1..losses.len().max(2), 0f32..max_loss * 1.1 + f32::EPSILON)?;
    chart.configure_mesh().x_desc("epoch").y_desc("loss").draw()?;

    chart.draw_series(LineSeries::new(
        losses.iter().enumerate().map(|(i, l)| (i + 1, *l)),
        &RED,
    ))?;
    chart.draw_series(
        losses
            .iter()
            .enumerate()
            .map(|(i, l)| Circle::new((i + 1, *l), 3, RED.filled())),
    )?;

    root_area.present()?;
    log::info!("Loss plot saved to '{}'.", file_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    fn temp_png(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("digit-mlp-{}-{}.png", name, std::process::id()))
    }

    #[test]
    fn test_view_classify_rejects_wrong_image_size() {
        let path = temp_png("wrong-size");
        let err = view_classify(&[0.0; 10], &[0.1; 10], path.to_str().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "expected an image of 784 pixels, got 10");
        assert!(!path.exists());
    }

    #[test]
    fn test_plots_render_to_png() {
        let image = vec![0.0; IMAGE_PIXELS];
        let mut probs = vec![0.0; 10];
        probs[3] = 1.0;
        let classify = temp_png("classify");
        let losses = temp_png("losses");

        // text rendering depends on the fonts installed, so only check what was written
        if view_classify(&image, &probs, classify.to_str().unwrap()).is_ok() {
            assert!(fs::metadata(&classify).unwrap().len() > 0);
            fs::remove_file(&classify).unwrap();
        }
        if plot_losses(&[2.3, 1.1, 0.6], losses.to_str().unwrap()).is_ok() {
            assert!(fs::metadata(&losses).unwrap().len() > 0);
            fs::remove_file(&losses).unwrap();
        }
    }
}

//! Spatial grouping of extracted PDF images. Small images that sit close
//! together on a page (icon strips, diagram fragments) are clustered by
//! transitive closure over pairwise distance and re-rendered as one
//! composite PNG cropped from the page bitmap. Chunks then reference the
//! composite, never the member singletons.

use tracing::{debug, warn};

use super::parser::{ExtractedImage, ParsedDocument};

pub const COMPOSITE_DPI: f32 = 150.0;
const PDF_UNITS_PER_INCH: f32 = 72.0;
const PADDING_RATIO: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct SpatialConfig {
    /// Max center-to-center distance (points) for two images to be linked.
    pub threshold: f32,
    pub min_group_size: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            min_group_size: 2,
        }
    }
}

fn center(image: &ExtractedImage) -> Option<(f32, f32)> {
    let x = image.x_pdf?;
    let y = image.y_pdf?;
    Some((x + image.width / 2.0, y + image.height / 2.0))
}

/// Connected components (by index) of images on the same page within the
/// distance threshold. Only components of at least `min_group_size` are
/// returned, each ordered by original image index.
pub fn group_images(images: &[ExtractedImage], cfg: &SpatialConfig) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..images.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }

    for i in 0..images.len() {
        for j in (i + 1)..images.len() {
            let (a, b) = (&images[i], &images[j]);
            if a.page_number.is_none() || a.page_number != b.page_number {
                continue;
            }
            let (Some(ca), Some(cb)) = (center(a), center(b)) else {
                continue;
            };
            let dist = ((ca.0 - cb.0).powi(2) + (ca.1 - cb.1).powi(2)).sqrt();
            if dist <= cfg.threshold {
                let (ra, rb) = (find(&mut parent, i), find(&mut parent, j));
                if ra != rb {
                    parent[ra] = rb;
                }
            }
        }
    }

    let mut components: std::collections::BTreeMap<usize, Vec<usize>> =
        std::collections::BTreeMap::new();
    for i in 0..images.len() {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(i);
    }

    components
        .into_values()
        .filter(|members| members.len() >= cfg.min_group_size)
        .collect()
}

/// Replace each spatial group's members with one composite image rendered
/// from the page bitmap. When page rendering is unavailable the groups are
/// left as singletons; the document still indexes.
pub fn apply_composites(pdf_bytes: &[u8], parsed: &mut ParsedDocument, cfg: &SpatialConfig) {
    let groups = group_images(&parsed.images, cfg);
    if groups.is_empty() {
        return;
    }

    let mut composites: Vec<(Vec<usize>, ExtractedImage)> = Vec::new();
    for (group_id, members) in groups.iter().enumerate() {
        match render_composite(pdf_bytes, &parsed.images, members, group_id as i32) {
            Ok(composite) => composites.push((members.clone(), composite)),
            Err(e) => {
                warn!(group = group_id, error = %e, "composite render failed, keeping singletons");
            }
        }
    }

    if composites.is_empty() {
        return;
    }

    let replaced: std::collections::HashSet<usize> = composites
        .iter()
        .flat_map(|(members, _)| members.iter().copied())
        .collect();

    let mut images = Vec::with_capacity(parsed.images.len());
    for (i, image) in parsed.images.drain(..).enumerate() {
        if !replaced.contains(&i) {
            images.push(image);
        }
    }
    for (_, composite) in composites {
        images.push(composite);
    }
    debug!(count = images.len(), "images after composite grouping");
    parsed.images = images;
}

fn render_composite(
    pdf_bytes: &[u8],
    images: &[ExtractedImage],
    members: &[usize],
    group_id: i32,
) -> anyhow::Result<ExtractedImage> {
    use image::GenericImageView;
    use pdfium_render::prelude::*;

    let first = &images[members[0]];
    let page_number = first
        .page_number
        .ok_or_else(|| anyhow::anyhow!("group member without page number"))?;

    // Bounding box over all members, in points.
    let mut left = f32::MAX;
    let mut bottom = f32::MAX;
    let mut right = f32::MIN;
    let mut top = f32::MIN;
    for &i in members {
        let image = &images[i];
        let (Some(x), Some(y)) = (image.x_pdf, image.y_pdf) else {
            anyhow::bail!("group member without coordinates");
        };
        left = left.min(x);
        bottom = bottom.min(y);
        right = right.max(x + image.width);
        top = top.max(y + image.height);
    }

    let pad_x = (right - left) * PADDING_RATIO;
    let pad_y = (top - bottom) * PADDING_RATIO;

    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| anyhow::anyhow!("pdfium binding: {e}"))?;
    let pdfium = Pdfium::new(bindings);
    let doc = pdfium
        .load_pdf_from_byte_vec(pdf_bytes.to_vec(), None)
        .map_err(|e| anyhow::anyhow!("pdfium open: {e}"))?;
    let page = doc
        .pages()
        .get((page_number - 1) as u16)
        .map_err(|e| anyhow::anyhow!("pdfium page {page_number}: {e}"))?;

    let page_width = page.width().value;
    let page_height = page.height().value;

    // Pad then clamp to the page box.
    let left = (left - pad_x).max(0.0);
    let bottom = (bottom - pad_y).max(0.0);
    let right = (right + pad_x).min(page_width);
    let top = (top + pad_y).min(page_height);

    let scale = COMPOSITE_DPI / PDF_UNITS_PER_INCH;
    let target_width = (page_width * scale).round().max(1.0) as i32;

    let render_config = PdfRenderConfig::new().set_target_width(target_width);
    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| anyhow::anyhow!("pdfium render: {e}"))?
        .as_image();

    // Rendered bitmap origin is top-left; PDF origin is bottom-left.
    let actual_scale = bitmap.width() as f32 / page_width;
    let crop_x = (left * actual_scale).floor().max(0.0) as u32;
    let crop_y = ((page_height - top) * actual_scale).floor().max(0.0) as u32;
    let crop_w = (((right - left) * actual_scale).ceil() as u32)
        .min(bitmap.width().saturating_sub(crop_x))
        .max(1);
    let crop_h = (((top - bottom) * actual_scale).ceil() as u32)
        .min(bitmap.height().saturating_sub(crop_y))
        .max(1);

    let cropped = bitmap.crop_imm(crop_x, crop_y, crop_w, crop_h);
    let mut png = Vec::new();
    cropped.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;

    Ok(ExtractedImage {
        bytes: png,
        mime: "image/png".to_string(),
        alt_text: format!("composite of {} grouped images", members.len()),
        approximate_offset: first.approximate_offset,
        page_number: Some(page_number),
        x_pdf: Some(left),
        y_pdf: Some(bottom),
        width: crop_w as f32,
        height: crop_h as f32,
        spatial_group_id: Some(group_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(page: u32, x: f32, y: f32, size: f32) -> ExtractedImage {
        ExtractedImage {
            bytes: Vec::new(),
            mime: "image/png".into(),
            alt_text: String::new(),
            approximate_offset: 0,
            page_number: Some(page),
            x_pdf: Some(x),
            y_pdf: Some(y),
            width: size,
            height: size,
            spatial_group_id: None,
        }
    }

    #[test]
    fn five_icons_in_small_square_form_one_group() {
        // 80x80pt square of 16pt icons on page 2.
        let images = vec![
            image(2, 100.0, 100.0, 16.0),
            image(2, 140.0, 100.0, 16.0),
            image(2, 100.0, 140.0, 16.0),
            image(2, 140.0, 140.0, 16.0),
            image(2, 120.0, 120.0, 16.0),
        ];
        let groups = group_images(&images, &SpatialConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 5);
    }

    #[test]
    fn distant_images_are_not_grouped() {
        let images = vec![image(1, 0.0, 0.0, 10.0), image(1, 500.0, 500.0, 10.0)];
        let groups = group_images(&images, &SpatialConfig::default());
        assert!(groups.is_empty());
    }

    #[test]
    fn different_pages_never_group() {
        let images = vec![image(1, 100.0, 100.0, 10.0), image(2, 100.0, 100.0, 10.0)];
        let groups = group_images(&images, &SpatialConfig::default());
        assert!(groups.is_empty());
    }

    #[test]
    fn transitive_closure_links_chains() {
        // a-b and b-c are within threshold; a-c is not. One group of three.
        let images = vec![
            image(1, 0.0, 0.0, 10.0),
            image(1, 90.0, 0.0, 10.0),
            image(1, 180.0, 0.0, 10.0),
        ];
        let groups = group_images(&images, &SpatialConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn min_group_size_filters_pairs() {
        let images = vec![image(1, 0.0, 0.0, 10.0), image(1, 20.0, 0.0, 10.0)];
        let cfg = SpatialConfig {
            threshold: 100.0,
            min_group_size: 3,
        };
        assert!(group_images(&images, &cfg).is_empty());
    }

    #[test]
    fn images_without_coordinates_stay_ungrouped() {
        let mut no_coords = image(1, 0.0, 0.0, 10.0);
        no_coords.x_pdf = None;
        no_coords.y_pdf = None;
        let images = vec![no_coords, image(1, 0.0, 0.0, 10.0), image(1, 5.0, 0.0, 10.0)];
        let groups = group_images(&images, &SpatialConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![1, 2]);
    }
}

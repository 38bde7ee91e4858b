//! Clinical PDF report for one classified scan.
//!
//! Layer thickness figures are fixed placeholders until segmentation exists;
//! nothing in this module measures the retina.

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::DynamicImage;
use printpdf::{
    path::PaintMode, BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Line, Mm,
    PdfDocument, PdfDocumentReference, PdfLayerReference, Point, Rect, Rgb,
};
use thiserror::Error;

use crate::model::PredictionResult;

pub const REPORT_TITLE: &str = "OCT Diagnostic Report";

/// Retinal layer thickness in micrometres. Demonstration values, not measurements.
pub const PLACEHOLDER_LAYER_THICKNESS: [(&str, f32); 6] = [
    ("RNFL", 76.4),
    ("GCL", 31.9),
    ("IPL", 21.7),
    ("OPL", 19.4),
    ("INL", 18.1),
    ("ONL", 85.2),
];

pub const SHARED_OVERLAY: &str = "result.jpg";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to render PDF: {0}")]
    Pdf(#[from] printpdf::Error),
    #[error("failed to write report {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub summary: String,
    pub recommendation: String,
}

pub fn assess(result: &PredictionResult) -> Assessment {
    let conf_pct = result.confidence * 100.0;
    if result.top_disease.eq_ignore_ascii_case("NORMAL") {
        Assessment {
            summary: format!(
                "AI suggests no significant abnormalities detected ({conf_pct:.1}% confidence)."
            ),
            recommendation: "Routine monitoring advised; follow standard screening intervals."
                .to_string(),
        }
    } else {
        Assessment {
            summary: format!("AI suggests {} with {conf_pct:.1}% confidence.", result.top_disease),
            recommendation:
                "Recommend ophthalmology evaluation and correlation with clinical findings."
                    .to_string(),
        }
    }
}

pub fn disease_full_name(label: &str) -> String {
    let full = match label {
        "AMD" => "AMD (Age-Related Macular Degeneration)",
        "CNV" => "CNV (Choroidal Neovascularization)",
        "CSR" => "CSR (Central Serous Retinopathy)",
        "DME" => "DME (Diabetic Macular Edema)",
        "DR" => "DR (Diabetic Retinopathy)",
        "DRUSEN" => "DRUSEN (Diabetic Retinopathy with Uveitis)",
        "MH" => "MH (Macular Hole)",
        "NORMAL" => "NORMAL (Normal)",
        other => other,
    };
    full.to_string()
}

/// Per-scan overlay if one was produced, otherwise the shared demonstration overlay.
pub fn locate_overlay(results_dir: &Path, image_id: &str) -> Option<PathBuf> {
    [
        results_dir.join(format!("{image_id}_overlay.jpg")),
        results_dir.join(SHARED_OVERLAY),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

pub fn report_path(reports_dir: &Path, image_id: &str) -> PathBuf {
    reports_dir.join(format!("{image_id}_report.pdf"))
}

pub struct ReportData<'a> {
    pub image_id: &'a str,
    pub image_path: &'a Path,
    pub overlay_path: Option<&'a Path>,
    pub prediction: &'a PredictionResult,
    pub layer_thickness: &'a [(&'a str, f32)],
    pub generated_at: String,
}

/// Renders the report and writes it to `<reports_dir>/<image_id>_report.pdf`, replacing any
/// earlier report for the same scan.
pub fn generate_report(reports_dir: &Path, data: &ReportData<'_>) -> Result<Vec<u8>, ReportError> {
    let bytes = render(data)?;
    let path = report_path(reports_dir, data.image_id);
    fs::write(&path, &bytes).map_err(|source| ReportError::Write {
        path: path.clone(),
        source,
    })?;
    tracing::info!(image_id = data.image_id, path = %path.display(), "report written");
    Ok(bytes)
}

// A4 with 36pt side margins and 48pt top/bottom margins.
const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN_X: f32 = 12.7;
const MARGIN_Y: f32 = 16.9;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN_X;
const PT: f32 = 0.3528;
const IMAGE_DPI: f32 = 300.0;
const TABLE_ROW_HEIGHT: f32 = 7.0;
const CELL_PADDING: f32 = 2.8;

fn hex(rgb: u32) -> Color {
    let channel = |shift: u32| ((rgb >> shift) & 0xff) as f32 / 255.0;
    Color::Rgb(Rgb::new(channel(16), channel(8), channel(0), None))
}

const HEADER_BLUE: u32 = 0x2E5AAC;
const GRID: u32 = 0xE1E5EE;
const BORDER: u32 = 0xC7CDDB;
const BAND_LIGHT: u32 = 0xF8F9FB;
const BAND_DARK: u32 = 0xEEF2F9;
const BLACK: u32 = 0x000000;
const WHITE: u32 = 0xFFFFFF;

/// Rough Helvetica advance width; builtin fonts carry no metrics.
fn text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * 0.5 * PT
}

fn wrap(text: &str, size: f32, width: f32) -> Vec<String> {
    let max_chars = ((width / (size * 0.5 * PT)) as usize).max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    italic: IndirectFontRef,
}

/// Top-down cursor over the document that starts new pages as content runs out.
struct Canvas<'a> {
    doc: &'a PdfDocumentReference,
    layer: PdfLayerReference,
    fonts: Fonts,
    footer: String,
    pages: usize,
    y: f32,
}

impl<'a> Canvas<'a> {
    fn new(
        doc: &'a PdfDocumentReference,
        layer: PdfLayerReference,
        fonts: Fonts,
        footer: String,
    ) -> Self {
        let canvas = Canvas {
            doc,
            layer,
            fonts,
            footer,
            pages: 1,
            y: PAGE_HEIGHT - MARGIN_Y,
        };
        canvas.draw_footer();
        canvas
    }

    fn draw_footer(&self) {
        let size = 8.0;
        let x = PAGE_WIDTH - MARGIN_X - text_width(&self.footer, size);
        self.layer.set_fill_color(hex(BLACK));
        self.layer
            .use_text(self.footer.clone(), size, Mm(x), Mm(MARGIN_Y - 3.5), &self.fonts.regular);
    }

    fn ensure_space(&mut self, height: f32) {
        if self.y - height >= MARGIN_Y {
            return;
        }
        self.pages += 1;
        let (page, layer) = self.doc.add_page(
            Mm(PAGE_WIDTH),
            Mm(PAGE_HEIGHT),
            format!("Page {}", self.pages),
        );
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = PAGE_HEIGHT - MARGIN_Y;
        self.draw_footer();
    }

    fn space(&mut self, pt: f32) {
        self.y -= pt * PT;
    }

    fn text_at(&self, text: &str, size: f32, x: f32, baseline: f32, font: &IndirectFontRef) {
        self.layer.use_text(text, size, Mm(x), Mm(baseline), font);
    }

    fn paragraph(&mut self, text: &str, size: f32, font: Font) {
        let line_height = size * 1.2 * PT;
        for line in wrap(text, size, CONTENT_WIDTH) {
            self.ensure_space(line_height);
            self.y -= line_height;
            self.layer.set_fill_color(hex(BLACK));
            self.text_at(&line, size, MARGIN_X, self.y + line_height * 0.2, self.font(font));
        }
    }

    fn centered(&mut self, text: &str, size: f32, font: Font) {
        let line_height = size * 1.2 * PT;
        self.ensure_space(line_height);
        self.y -= line_height;
        let x = MARGIN_X + (CONTENT_WIDTH - text_width(text, size)).max(0.0) / 2.0;
        self.layer.set_fill_color(hex(BLACK));
        self.text_at(text, size, x, self.y + line_height * 0.2, self.font(font));
    }

    fn heading(&mut self, text: &str) {
        self.space(6.0);
        self.paragraph(text, 12.0, Font::Bold);
        self.space(3.0);
    }

    fn font(&self, font: Font) -> &IndirectFontRef {
        match font {
            Font::Regular => &self.fonts.regular,
            Font::Bold => &self.fonts.bold,
            Font::Italic => &self.fonts.italic,
        }
    }

    fn rect(&self, x: f32, y: f32, width: f32, height: f32, fill: u32) {
        self.layer.set_fill_color(hex(fill));
        let rect = Rect::new(Mm(x), Mm(y), Mm(x + width), Mm(y + height));
        self.layer.add_rect(rect.with_mode(PaintMode::Fill));
    }

    fn line(&self, from: (f32, f32), to: (f32, f32), thickness_pt: f32, color: u32) {
        self.layer.set_outline_color(hex(color));
        self.layer.set_outline_thickness(thickness_pt);
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(from.0), Mm(from.1)), false),
                (Point::new(Mm(to.0), Mm(to.1)), false),
            ],
            is_closed: false,
        });
    }

    /// Two-column table: blue header, banded body, second column right-aligned.
    fn table(&mut self, header: [&str; 2], rows: &[[String; 2]]) {
        let size = 10.0;
        let widths = [CONTENT_WIDTH * 0.6, CONTENT_WIDTH * 0.4];
        let x0 = MARGIN_X;
        let x1 = x0 + widths[0];
        let x2 = x1 + widths[1];

        let header_row = [header[0].to_string(), header[1].to_string()];
        let all_rows = std::iter::once((0, &header_row))
            .chain(rows.iter().enumerate().map(|(i, r)| (i + 1, r)));

        let mut segment_top = self.y;
        for (index, row) in all_rows {
            if self.y - TABLE_ROW_HEIGHT < MARGIN_Y {
                self.table_border(x0, x2, segment_top);
                self.ensure_space(TABLE_ROW_HEIGHT);
                segment_top = self.y;
            }
            let bottom = self.y - TABLE_ROW_HEIGHT;
            let baseline = bottom + (TABLE_ROW_HEIGHT - size * PT) / 2.0 + 0.5;

            let (fill, text_color, font) = match index {
                0 => (HEADER_BLUE, WHITE, Font::Bold),
                i if i % 2 == 1 => (BAND_LIGHT, BLACK, Font::Regular),
                _ => (BAND_DARK, BLACK, Font::Regular),
            };
            self.rect(x0, bottom, x2 - x0, TABLE_ROW_HEIGHT, fill);

            self.layer.set_fill_color(hex(text_color));
            self.text_at(&row[0], size, x0 + CELL_PADDING, baseline, self.font(font));
            let value_x = if index == 0 {
                x1 + CELL_PADDING
            } else {
                x2 - CELL_PADDING - text_width(&row[1], size)
            };
            self.text_at(&row[1], size, value_x, baseline, self.font(font));

            if index > 0 {
                self.line((x0, self.y), (x2, self.y), 0.25, GRID);
            }
            self.line((x1, self.y), (x1, bottom), 0.25, GRID);
            self.y = bottom;
        }
        self.table_border(x0, x2, segment_top);
    }

    fn table_border(&self, left: f32, right: f32, top: f32) {
        let bottom = self.y;
        self.line((left, top), (right, top), 0.5, BORDER);
        self.line((right, top), (right, bottom), 0.5, BORDER);
        self.line((right, bottom), (left, bottom), 0.5, BORDER);
        self.line((left, bottom), (left, top), 0.5, BORDER);
    }

    /// Input scan and overlay side by side; a missing image becomes a text cell.
    fn image_row(&mut self, cells: [(Option<DynamicImage>, &str); 2]) {
        let gap = 12.0 * PT;
        let col_width = (CONTENT_WIDTH - gap) / 2.0;
        let img_height = col_width * 0.75;
        let padding = 6.0 * PT;
        let row_height = img_height + 2.0 * padding;

        self.ensure_space(row_height);
        let top = self.y;
        for (col, (image, unavailable)) in cells.into_iter().enumerate() {
            let cell_x = MARGIN_X + col as f32 * (col_width + gap);
            match image {
                Some(image) => {
                    let (w, h) = (image.width() as f32, image.height() as f32);
                    let native_w = w / IMAGE_DPI * 25.4;
                    let native_h = h / IMAGE_DPI * 25.4;
                    let box_w = col_width - 2.0 * padding;
                    let scale = (box_w / native_w).min(img_height / native_h);
                    let x = cell_x + padding + (box_w - native_w * scale) / 2.0;
                    let y = top - padding - img_height + (img_height - native_h * scale) / 2.0;

                    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                    Image::from_dynamic_image(&rgb).add_to_layer(
                        self.layer.clone(),
                        ImageTransform {
                            translate_x: Some(Mm(x)),
                            translate_y: Some(Mm(y)),
                            scale_x: Some(scale),
                            scale_y: Some(scale),
                            dpi: Some(IMAGE_DPI),
                            ..Default::default()
                        },
                    );
                }
                None => {
                    let size = 10.0;
                    let x = cell_x + (col_width - text_width(unavailable, size)).max(0.0) / 2.0;
                    self.layer.set_fill_color(hex(BLACK));
                    self.text_at(unavailable, size, x, top - row_height / 2.0, &self.fonts.regular);
                }
            }
        }
        self.y = top - row_height;
    }
}

#[derive(Clone, Copy)]
enum Font {
    Regular,
    Bold,
    Italic,
}

fn load_image(path: Option<&Path>) -> Option<DynamicImage> {
    let path = path?;
    match image::open(path) {
        Ok(image) if image.width() > 0 && image.height() > 0 => Some(image),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "image left out of report");
            None
        }
    }
}

pub fn render(data: &ReportData<'_>) -> Result<Vec<u8>, ReportError> {
    let (doc, page, layer) = PdfDocument::new(REPORT_TITLE, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Page 1");
    let fonts = Fonts {
        regular: doc.add_builtin_font(BuiltinFont::Helvetica)?,
        bold: doc.add_builtin_font(BuiltinFont::HelveticaBold)?,
        italic: doc.add_builtin_font(BuiltinFont::HelveticaOblique)?,
    };
    let layer = doc.get_page(page).get_layer(layer);
    let footer = format!("AI generated - {}", data.generated_at);
    let mut canvas = Canvas::new(&doc, layer, fonts, footer);

    canvas.centered(REPORT_TITLE, 18.0, Font::Bold);
    canvas.space(4.0);
    canvas.paragraph("Generated using AI-assisted retinal imaging analysis", 10.0, Font::Italic);
    canvas.space(12.0);

    let label = "Scan ID: ";
    canvas.paragraph(label, 10.0, Font::Regular);
    let baseline = canvas.y + 10.0 * 1.2 * PT * 0.2;
    canvas.text_at(
        data.image_id,
        10.0,
        MARGIN_X + text_width(label, 10.0),
        baseline,
        &canvas.fonts.bold,
    );
    canvas.paragraph(&format!("Generated: {}", data.generated_at), 10.0, Font::Regular);
    canvas.space(18.0);

    let assessment = assess(data.prediction);
    canvas.heading("Summary");
    canvas.paragraph(&assessment.summary, 10.0, Font::Regular);
    canvas.space(6.0);
    canvas.heading("Recommendation");
    canvas.paragraph(&assessment.recommendation, 10.0, Font::Regular);
    canvas.space(18.0);

    let input_image = load_image(Some(data.image_path));
    let overlay_image = load_image(data.overlay_path);
    if input_image.is_some() || overlay_image.is_some() {
        canvas.heading("Images");
        canvas.image_row([
            (input_image, "Input image unavailable"),
            (overlay_image, "Mask image unavailable"),
        ]);
        canvas.space(18.0);
    }

    canvas.heading("Disease Probability Analysis");
    let prediction_rows: Vec<[String; 2]> = data
        .prediction
        .predictions
        .iter()
        .map(|(label, prob)| [disease_full_name(label), format!("{:.2}%", prob * 100.0)])
        .collect();
    canvas.table(["Disease", "Probability"], &prediction_rows);
    canvas.space(18.0);

    canvas.heading("Retinal Layer Thickness (micrometres)");
    let thickness_rows: Vec<[String; 2]> = data
        .layer_thickness
        .iter()
        .map(|(layer, value)| [layer.to_string(), value.to_string()])
        .collect();
    canvas.table(["Layer", "Thickness (um)"], &thickness_rows);

    canvas.space(24.0);
    canvas.paragraph(
        "This report is automatically generated and intended for clinical review assistance. \
         It should not be used as the sole basis for diagnosis.",
        10.0,
        Font::Regular,
    );

    drop(canvas);
    Ok(doc.save_to_bytes()?)
}

//! SVGチャート生成
//!
//! 学習履歴（精度・損失）と混同行列をSVGとして書き出します。

use std::fs;
use std::path::Path;

const CHART_WIDTH: f64 = 960.0;
const CHART_HEIGHT: f64 = 420.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 60.0;
const MARGIN_LEFT: f64 = 70.0;
const PANEL_GAP: f64 = 60.0;

const COLOR_TRAIN: &str = "#3498db";
const COLOR_VAL: &str = "#e67e22";
const COLOR_BOUNDARY: &str = "#7f8c8d";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// 学習履歴の1点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub epoch: usize,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub train_loss: f64,
    pub val_loss: f64,
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn svg_header(width: f64, height: f64) -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}"><rect width="{w}" height="{h}" fill="white"/>"#,
        w = width,
        h = height
    )
}

fn text(x: f64, y: f64, size: u32, anchor: &str, content: &str) -> String {
    format!(
        r#"<text x="{:.1}" y="{:.1}" text-anchor="{}" font-family="Arial, sans-serif" font-size="{}" fill="{}">{}</text>"#,
        x,
        y,
        anchor,
        size,
        COLOR_TEXT,
        escape_xml(content)
    )
}

/// 1枚のパネル（2系列の折れ線）を描く
#[allow(clippy::too_many_arguments)]
fn line_panel(
    svg: &mut String,
    left: f64,
    width: f64,
    title: &str,
    epochs: &[f64],
    train: &[f64],
    val: &[f64],
    boundary: Option<f64>,
) {
    let top = MARGIN_TOP;
    let height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let x_min = epochs.first().copied().unwrap_or(0.0);
    let x_max = epochs.last().copied().unwrap_or(1.0).max(x_min + 1.0);
    let y_max = train
        .iter()
        .chain(val)
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max)
        .max(1e-6);

    let sx = |x: f64| left + (x - x_min) / (x_max - x_min) * width;
    let sy = |y: f64| top + height - (y / y_max) * height;

    svg.push_str(&text(left + width / 2.0, top - 15.0, 16, "middle", title));

    for i in 0..=4 {
        let value = y_max * i as f64 / 4.0;
        let y = sy(value);
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="1"/>"#,
            left,
            y,
            left + width,
            y,
            COLOR_GRID
        ));
        svg.push_str(&text(left - 8.0, y + 4.0, 11, "end", &format!("{:.2}", value)));
    }

    svg.push_str(&format!(
        r#"<polyline points="{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="2"/>"#,
        left,
        top,
        left,
        top + height,
        left + width,
        top + height,
        COLOR_AXIS
    ));
    svg.push_str(&text(left + width / 2.0, top + height + 35.0, 12, "middle", "epoch"));

    if let Some(b) = boundary {
        let x = sx(b);
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="1.5" stroke-dasharray="6,4"/>"#,
            x,
            top,
            x,
            top + height,
            COLOR_BOUNDARY
        ));
        svg.push_str(&text(x + 4.0, top + 12.0, 11, "start", "fine-tune"));
    }

    for (values, color, label, offset) in [
        (train, COLOR_TRAIN, "train", 0.0),
        (val, COLOR_VAL, "validation", 16.0),
    ] {
        let points: Vec<String> = epochs
            .iter()
            .zip(values)
            .filter(|(_, v)| v.is_finite())
            .map(|(&x, &y)| format!("{:.1},{:.1}", sx(x), sy(y)))
            .collect();
        if !points.is_empty() {
            svg.push_str(&format!(
                r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
                points.join(" "),
                color
            ));
        }

        let ly = top + height + 50.0 - offset;
        let lx = left + width - 110.0;
        svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="2"/>"#,
            lx,
            ly - 4.0,
            lx + 20.0,
            ly - 4.0,
            color
        ));
        svg.push_str(&text(lx + 26.0, ly, 11, "start", label));
    }
}

/// 精度と損失の推移（train / validation）をSVGにする
///
/// `boundary` はファインチューニング開始エポック（破線で表示）。
pub fn render_training_history(history: &[HistoryPoint], boundary: Option<usize>) -> String {
    let epochs: Vec<f64> = history.iter().map(|p| p.epoch as f64).collect();
    let pick = |f: fn(&HistoryPoint) -> f64| history.iter().map(f).collect::<Vec<f64>>();
    let boundary = boundary.map(|b| b as f64 - 0.5);

    let panel_width = (CHART_WIDTH - MARGIN_LEFT * 2.0 - MARGIN_RIGHT - PANEL_GAP) / 2.0;

    let mut svg = svg_header(CHART_WIDTH, CHART_HEIGHT);
    line_panel(
        &mut svg,
        MARGIN_LEFT,
        panel_width,
        "Accuracy",
        &epochs,
        &pick(|p| p.train_accuracy),
        &pick(|p| p.val_accuracy),
        boundary,
    );
    line_panel(
        &mut svg,
        MARGIN_LEFT * 2.0 + panel_width + PANEL_GAP,
        panel_width,
        "Loss",
        &epochs,
        &pick(|p| p.train_loss),
        &pick(|p| p.val_loss),
        boundary,
    );
    svg.push_str("</svg>");
    svg
}

/// 混同行列のヒートマップ（行=正解, 列=予測）
pub fn render_confusion_matrix(counts: &[Vec<usize>], labels: &[String]) -> String {
    let n = counts.len().max(1);
    let cell = (640.0 / n as f64).clamp(14.0, 48.0);
    let label_space = 110.0;
    let width = label_space + cell * n as f64 + 30.0;
    let height = label_space + cell * n as f64 + 40.0;
    let max = counts.iter().flatten().copied().max().unwrap_or(0).max(1);

    let mut svg = svg_header(width, height);
    svg.push_str(&text(width / 2.0, 25.0, 16, "middle", "Confusion Matrix"));

    for (r, row) in counts.iter().enumerate() {
        for (c, &count) in row.iter().enumerate() {
            let x = label_space + c as f64 * cell;
            let y = label_space + r as f64 * cell;
            let intensity = count as f64 / max as f64;
            let shade = (255.0 - intensity * 200.0).round() as u8;
            svg.push_str(&format!(
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="rgb({},{},255)" stroke="white"/>"#,
                x, y, cell, cell, shade, shade
            ));
            if count > 0 && cell >= 18.0 {
                svg.push_str(&text(x + cell / 2.0, y + cell / 2.0 + 4.0, 10, "middle", &count.to_string()));
            }
        }
    }

    for (i, label) in labels.iter().enumerate().take(n) {
        let offset = label_space + (i as f64 + 0.5) * cell;
        // 行ラベル（正解）
        svg.push_str(&text(label_space - 6.0, offset + 4.0, 10, "end", label));
        // 列ラベル（予測）
        svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" text-anchor="start" font-family="Arial, sans-serif" font-size="10" fill="{}" transform="rotate(-60 {:.1} {:.1})">{}</text>"#,
            offset,
            label_space - 6.0,
            COLOR_TEXT,
            offset,
            label_space - 6.0,
            escape_xml(label)
        ));
    }

    svg.push_str(&text(label_space + cell * n as f64 / 2.0, height - 10.0, 12, "middle", "predicted"));
    svg.push_str("</svg>");
    svg
}

/// SVG文字列をファイルに保存（親ディレクトリも作成）
pub fn save_svg(svg: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, svg)
}

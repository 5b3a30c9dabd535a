// =============================================================================
// Canvas backend — the drawing surface the renderer paints onto
// =============================================================================
//
// The renderer never talks to a concrete graphics API. A UI host implements
// `Canvas` for its surface (2D context, GPU batcher, ...). `RecordingCanvas`
// captures the command stream for the headless runner and for tests.
// =============================================================================

/// CSS-style colour string, e.g. `"#26a69a"`.
pub type Color = &'static str;

/// Palette used by the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Theme {
    pub background: Color,
    pub grid: Color,
    pub axis_text: Color,
    pub candle_up: Color,
    pub candle_down: Color,
    pub volume_up: Color,
    pub volume_down: Color,
    pub crosshair: Color,
    pub tooltip_bg: Color,
    pub status_text: Color,
    /// Cycled through for indicator lines.
    pub series: [Color; 6],
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            background: "#131722",
            grid: "#2a2e39",
            axis_text: "#b2b5be",
            candle_up: "#26a69a",
            candle_down: "#ef5350",
            volume_up: "#26a69a80",
            volume_down: "#ef535080",
            crosshair: "#9598a1",
            tooltip_bg: "#1e222d",
            status_text: "#f0b90b",
            series: ["#2962ff", "#ff9800", "#ab47bc", "#00bcd4", "#e91e63", "#8bc34a"],
        }
    }
}

/// Paint phase markers; emitted in frame order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Grid,
    Candles,
    Volume,
    Indicators,
    Drawings,
    Crosshair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

pub trait Canvas {
    /// Start a frame: wipe the whole surface with `color`.
    fn clear(&mut self, width: f64, height: f64, color: &str);

    /// Phase marker. Backends that batch per layer can flush here.
    fn begin_layer(&mut self, _layer: Layer) {}

    fn line(&mut self, from: (f64, f64), to: (f64, f64), color: &str, width: f64, dashed: bool);

    fn polyline(&mut self, points: &[(f64, f64)], color: &str, width: f64, dashed: bool);

    fn fill_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: &str);

    fn stroke_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: &str, line_width: f64);

    fn text(&mut self, x: f64, y: f64, text: &str, color: &str, align: TextAlign);
}

// =============================================================================
// RecordingCanvas
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Clear { width: f64, height: f64, color: String },
    Layer(Layer),
    Line { from: (f64, f64), to: (f64, f64), color: String, width: f64, dashed: bool },
    Polyline { points: Vec<(f64, f64)>, color: String, width: f64, dashed: bool },
    FillRect { x: f64, y: f64, width: f64, height: f64, color: String },
    StrokeRect { x: f64, y: f64, width: f64, height: f64, color: String, line_width: f64 },
    Text { x: f64, y: f64, text: String, color: String, align: TextAlign },
}

/// Keeps the commands of the most recent frame.
#[derive(Debug, Clone, Default)]
pub struct RecordingCanvas {
    commands: Vec<DrawCommand>,
    frames: u64,
}

impl RecordingCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// Frames started since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Layer markers of the last frame, in paint order.
    pub fn layers(&self) -> Vec<Layer> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Layer(l) => Some(*l),
                _ => None,
            })
            .collect()
    }

    /// Commands emitted after `layer`'s marker and before the next marker.
    pub fn in_layer(&self, layer: Layer) -> Vec<&DrawCommand> {
        let mut inside = false;
        let mut out = Vec::new();
        for cmd in &self.commands {
            match cmd {
                DrawCommand::Layer(l) => inside = *l == layer,
                other if inside => out.push(other),
                _ => {}
            }
        }
        out
    }

    pub fn texts(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Canvas for RecordingCanvas {
    fn clear(&mut self, width: f64, height: f64, color: &str) {
        self.commands.clear();
        self.frames += 1;
        self.commands.push(DrawCommand::Clear { width, height, color: color.to_string() });
    }

    fn begin_layer(&mut self, layer: Layer) {
        self.commands.push(DrawCommand::Layer(layer));
    }

    fn line(&mut self, from: (f64, f64), to: (f64, f64), color: &str, width: f64, dashed: bool) {
        self.commands.push(DrawCommand::Line { from, to, color: color.to_string(), width, dashed });
    }

    fn polyline(&mut self, points: &[(f64, f64)], color: &str, width: f64, dashed: bool) {
        self.commands.push(DrawCommand::Polyline {
            points: points.to_vec(),
            color: color.to_string(),
            width,
            dashed,
        });
    }

    fn fill_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: &str) {
        self.commands.push(DrawCommand::FillRect { x, y, width, height, color: color.to_string() });
    }

    fn stroke_rect(&mut self, x: f64, y: f64, width: f64, height: f64, color: &str, line_width: f64) {
        self.commands.push(DrawCommand::StrokeRect {
            x,
            y,
            width,
            height,
            color: color.to_string(),
            line_width,
        });
    }

    fn text(&mut self, x: f64, y: f64, text: &str, color: &str, align: TextAlign) {
        self.commands.push(DrawCommand::Text {
            x,
            y,
            text: text.to_string(),
            color: color.to_string(),
            align,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_starts_a_new_frame() {
        let mut c = RecordingCanvas::new();
        c.clear(10.0, 10.0, "#000");
        c.line((0.0, 0.0), (1.0, 1.0), "#fff", 1.0, false);
        c.clear(10.0, 10.0, "#000");
        assert_eq!(c.frames(), 2);
        assert_eq!(c.commands().len(), 1);
    }

    #[test]
    fn commands_are_grouped_by_layer() {
        let mut c = RecordingCanvas::new();
        c.clear(10.0, 10.0, "#000");
        c.begin_layer(Layer::Grid);
        c.line((0.0, 0.0), (1.0, 0.0), "#111", 1.0, false);
        c.begin_layer(Layer::Candles);
        c.fill_rect(0.0, 0.0, 1.0, 1.0, "#0f0");
        c.text(0.0, 0.0, "hi", "#fff", TextAlign::Left);

        assert_eq!(c.layers(), vec![Layer::Grid, Layer::Candles]);
        assert_eq!(c.in_layer(Layer::Candles).len(), 2);
        assert_eq!(c.in_layer(Layer::Volume).len(), 0);
        assert_eq!(c.texts(), vec!["hi"]);
    }
}

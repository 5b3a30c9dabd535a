// =============================================================================
// Rendering Module
// =============================================================================
//
// Viewport transforms, the canvas abstraction, user drawings and the
// dirty-flag chart renderer. Nothing in here touches the network or the
// cache; the app layer feeds candles and indicator outputs in.

pub mod canvas;
pub mod drawing;
pub mod gesture;
pub mod renderer;
pub mod viewport;

pub use canvas::{Canvas, DrawCommand, Layer, RecordingCanvas, TextAlign, Theme};
pub use drawing::{ChartPoint, Drawing, DrawingKind, DrawingStyle, FIB_LEVELS};
pub use gesture::{plan_refetch, RefetchDebouncer, RefetchRequest};
pub use renderer::{format_price, format_time_label, price_ticks, time_ticks, ChartRenderer};
pub use viewport::{LinkedTimeAxis, PriceScale, Rect, TimeRange, Viewport};

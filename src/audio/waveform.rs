//! Live waveform scope
//!
//! Paints the analysis window as a line trace on a [`Surface`], fading the
//! previous frame so older traces leave a short trail. The loop runs on its
//! own fixed cadence and never looks at network state: a stalled socket does
//! not stall the scope.
//!
//! The render task owns its surface. Once the liveness token is cancelled the
//! task stops re-arming its tick and drops the surface, so nothing can draw
//! onto it after the session has gone away.

use std::io::{self, Write};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::analysis::AnalysisTap;

/// Fraction of the previous frame erased before each redraw
pub const FADE_ALPHA: f32 = 0.2;

/// Default redraw rate (one redraw per display refresh)
pub const DEFAULT_FPS: u32 = 60;

/// Upper bound on the redraw rate; keeps the tick period at 1 ms or more
pub const MAX_FPS: u32 = 1000;

/// Intensity ramp used when rendering a grid as text
const RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#'];

/// Something the renderer can paint a trace onto.
pub trait Surface: Send + 'static {
    /// Width and height in drawing units
    fn size(&self) -> (usize, usize);

    /// Dim everything already drawn by `alpha` (0 = keep, 1 = erase).
    fn fade(&mut self, alpha: f32);

    /// Draw a connected polyline through `points`.
    fn stroke(&mut self, points: &[(f32, f32)]);

    /// Push the finished frame to wherever it is displayed.
    fn present(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Map a time-domain window onto trace points for a `width` x `height` surface.
///
/// x advances `width / len` per sample; y is `(1 + s) * height / 2`, so
/// silence sits on the horizontal midline. The trace always ends at the
/// right edge on the midline.
pub fn trace_points(samples: &[f32], width: usize, height: usize) -> Vec<(f32, f32)> {
    let mut points = Vec::with_capacity(samples.len() + 1);
    let w = width as f32;
    let h = height as f32;

    if !samples.is_empty() {
        let slice_width = w / samples.len() as f32;
        let mut x = 0.0f32;
        for &s in samples {
            let v = 1.0 + s.clamp(-1.0, 1.0);
            points.push((x, v * h / 2.0));
            x += slice_width;
        }
    }

    points.push((w, h / 2.0));
    points
}

/// Character-cell surface holding an intensity per cell.
#[derive(Debug, Clone)]
pub struct GridSurface {
    width: usize,
    height: usize,
    cells: Vec<f32>,
}

impl GridSurface {
    pub fn new(width: usize, height: usize) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            cells: vec![0.0; width * height],
        }
    }

    /// Intensity at a cell, 0.0 to 1.0
    pub fn intensity(&self, col: usize, row: usize) -> f32 {
        if col >= self.width || row >= self.height {
            return 0.0;
        }
        self.cells[row * self.width + col]
    }

    fn plot(&mut self, col: i64, row: i64) {
        if col < 0 || row < 0 {
            return;
        }
        let (col, row) = (col as usize, row as usize);
        if col < self.width && row < self.height {
            self.cells[row * self.width + col] = 1.0;
        }
    }

    /// Bresenham line between two cells
    fn line(&mut self, from: (i64, i64), to: (i64, i64)) {
        let (mut x0, mut y0) = from;
        let (x1, y1) = to;
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        loop {
            self.plot(x0, y0);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn to_cell(&self, (x, y): (f32, f32)) -> (i64, i64) {
        let col = (x.floor() as i64).min(self.width as i64 - 1);
        let row = (y.floor() as i64).min(self.height as i64 - 1);
        (col, row)
    }

    /// Render the grid as lines of text, one character per cell.
    pub fn render_text(&self) -> String {
        let mut out = String::with_capacity((self.width + 1) * self.height);
        for row in 0..self.height {
            for col in 0..self.width {
                let v = self.cells[row * self.width + col].clamp(0.0, 1.0);
                let idx = (v * (RAMP.len() - 1) as f32).round() as usize;
                out.push(RAMP[idx]);
            }
            out.push('\n');
        }
        out
    }
}

impl Surface for GridSurface {
    fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn fade(&mut self, alpha: f32) {
        let keep = 1.0 - alpha.clamp(0.0, 1.0);
        for cell in &mut self.cells {
            *cell *= keep;
        }
    }

    fn stroke(&mut self, points: &[(f32, f32)]) {
        let mut prev: Option<(i64, i64)> = None;
        for &p in points {
            let cell = self.to_cell(p);
            match prev {
                Some(from) => self.line(from, cell),
                None => self.plot(cell.0, cell.1),
            }
            prev = Some(cell);
        }
    }
}

/// Grid surface redrawn in place on stdout with ANSI cursor control.
pub struct TerminalSurface {
    grid: GridSurface,
    out: io::Stdout,
}

impl TerminalSurface {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            grid: GridSurface::new(width, height),
            out: io::stdout(),
        }
    }
}

impl Surface for TerminalSurface {
    fn size(&self) -> (usize, usize) {
        self.grid.size()
    }

    fn fade(&mut self, alpha: f32) {
        self.grid.fade(alpha);
    }

    fn stroke(&mut self, points: &[(f32, f32)]) {
        self.grid.stroke(points);
    }

    fn present(&mut self) -> io::Result<()> {
        let text = self.grid.render_text();
        let mut lock = self.out.lock();
        // Home the cursor and overwrite the previous frame
        write!(lock, "\x1b[H{}", text)?;
        lock.flush()
    }
}

/// Handle to a running render loop.
pub struct RenderHandle {
    live: CancellationToken,
    task: JoinHandle<u64>,
}

impl RenderHandle {
    /// Clear the liveness flag. The loop will not schedule another frame.
    pub fn stop(&self) {
        self.live.cancel();
    }

    pub fn is_live(&self) -> bool {
        !self.live.is_cancelled()
    }

    /// True once the render task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit. Returns the number of frames drawn.
    pub async fn join(self) -> u64 {
        self.live.cancel();
        match self.task.await {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("Waveform renderer task ended abnormally: {}", e);
                0
            }
        }
    }

    /// Stop the loop without waiting; the task is aborted at its next await.
    pub fn abort(self) {
        self.live.cancel();
        self.task.abort();
    }
}

/// Spawn the render loop on the current tokio runtime.
///
/// Each iteration checks `live` before waiting for the next tick and again
/// before drawing, so a cancelled token stops the loop even if teardown
/// happens out of order.
pub fn spawn_renderer(
    tap: AnalysisTap,
    mut surface: Box<dyn Surface>,
    fps: u32,
    live: CancellationToken,
) -> RenderHandle {
    let fps = fps.clamp(1, MAX_FPS);
    let frame_interval = Duration::from_micros(1_000_000 / fps as u64);
    let token = live.clone();

    let task = tokio::spawn(async move {
        let mut tick = interval(frame_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut window = Vec::with_capacity(tap.capacity());
        let mut frames = 0u64;

        log::debug!("Waveform renderer started ({} fps)", fps);

        loop {
            if token.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }

            if token.is_cancelled() {
                break;
            }

            tap.snapshot_into(&mut window);
            let (width, height) = surface.size();
            let points = trace_points(&window, width, height);

            surface.fade(FADE_ALPHA);
            surface.stroke(&points);
            if let Err(e) = surface.present() {
                log::warn!("Waveform present failed: {}", e);
            }
            frames += 1;
        }

        drop(surface);
        log::debug!("Waveform renderer stopped after {} frames", frames);
        frames
    });

    RenderHandle { live, task }
}

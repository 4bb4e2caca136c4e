use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;
use anyhow::{Context, Result, bail};
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use clap::{CommandFactory, Parser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    AtomEnum, Colormap, ConnectionExt as _, CoordMode, ChangeGCAux, CreateGCAux,
    CreateWindowAux, Gcontext, Point, PropMode, Rectangle, Screen, Window, WindowClass,
};
use x11rb::wrapper::ConnectionExt as _;
use x11rb::COPY_DEPTH_FROM_PARENT;

// --- Options ---

/// Minimalist digital clock
#[derive(Parser, Debug)]
#[command(name = "dclock", disable_help_flag = true, args_override_self = true)]
struct Cli {
    /// Display this help
    #[arg(short, long)]
    help: bool,

    /// Fork into the background and detach from the terminal
    #[arg(short, long)]
    daemon: bool,

    /// Window geometry, WxH[+X+Y]; negative offsets count from the far screen edge
    #[arg(short, long, value_parser = parse_geometry, allow_hyphen_values = true)]
    geometry: Option<Geometry>,

    /// Background color [default: black]
    #[arg(short, long, value_name = "COLOR")]
    bg: Option<String>,

    /// Foreground 1 color, digits [default: white]
    #[arg(short, long, value_name = "COLOR")]
    fg: Option<String>,

    /// Foreground 2 color, dots [default: white]
    #[arg(short = 'c', long, value_name = "COLOR")]
    dc: Option<String>,

    /// Battery directory to monitor (holds power_now and energy_now)
    #[arg(long, value_name = "PATH")]
    bp: Option<PathBuf>,

    /// Battery low color, may be given twice [default: red, yellow]
    #[arg(long, value_name = "COLOR")]
    bc: Vec<String>,

    /// Only show the time, no date row or weekday bar
    #[arg(long)]
    no_date: bool,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn usage() {
    let _ = Cli::command().write_help(&mut io::stderr());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Offset {
    Near(i32),
    Far(i32),
}

impl Offset {
    /// Window origin on a screen axis of `extent` pixels. A far offset
    /// measures from the screen's far edge to the window's far edge.
    fn resolve(self, extent: u16, size: u16) -> i16 {
        let v = match self {
            Offset::Near(n) => n,
            Offset::Far(n) => extent as i32 - size as i32 - n,
        };
        v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Geometry {
    width: Option<u16>,
    height: Option<u16>,
    x: Option<Offset>,
    y: Option<Offset>,
}

// X geometry syntax: [=][W][{xX}H][{+-}X{+-}Y]
fn parse_geometry(s: &str) -> Result<Geometry, String> {
    let bad = || format!("invalid geometry '{s}'");
    let mut g = Geometry::default();
    let rest = s.strip_prefix('=').unwrap_or(s);

    let (w, mut rest) = split_digits(rest);
    if !w.is_empty() {
        g.width = Some(w.parse().map_err(|_| bad())?);
    }
    if let Some(tail) = rest.strip_prefix(['x', 'X']) {
        let (h, tail) = split_digits(tail);
        if h.is_empty() {
            return Err(bad());
        }
        g.height = Some(h.parse().map_err(|_| bad())?);
        rest = tail;
    }
    if !rest.is_empty() {
        let (x, tail) = split_offset(rest).ok_or_else(bad)?;
        let (y, tail) = split_offset(tail).ok_or_else(bad)?;
        if !tail.is_empty() {
            return Err(bad());
        }
        g.x = Some(x);
        g.y = Some(y);
    }
    Ok(g)
}

fn split_digits(s: &str) -> (&str, &str) {
    let n = s.bytes().take_while(u8::is_ascii_digit).count();
    s.split_at(n)
}

fn split_offset(s: &str) -> Option<(Offset, &str)> {
    let far = match s.as_bytes().first()? {
        b'+' => false,
        b'-' => true,
        _ => return None,
    };
    let (digits, tail) = split_digits(&s[1..]);
    let n: i32 = digits.parse().ok()?;
    Some((if far { Offset::Far(n) } else { Offset::Near(n) }, tail))
}

// --- Settings ---

#[derive(Debug)]
struct Settings {
    width: u16,
    height: u16,
    x: Offset,
    y: Offset,
    background: String,
    foreground: String,
    dots: String,
    battery: Option<PathBuf>,
    low_battery: [String; 2],
    daemonize: bool,
    show_date: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: 31,
            height: 22,
            x: Offset::Far(0),
            y: Offset::Far(0),
            background: "black".into(),
            foreground: "white".into(),
            dots: "white".into(),
            battery: None,
            low_battery: ["red".into(), "yellow".into()],
            daemonize: false,
            show_date: true,
        }
    }
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        let mut s = Settings::default();
        if let Some(g) = cli.geometry {
            s.width = g.width.unwrap_or(s.width);
            s.height = g.height.unwrap_or(s.height);
            s.x = g.x.unwrap_or(s.x);
            s.y = g.y.unwrap_or(s.y);
        }
        s.background = cli.bg.unwrap_or(s.background);
        s.foreground = cli.fg.unwrap_or(s.foreground);
        s.dots = cli.dc.unwrap_or(s.dots);
        // repeated --bc fills slot 0, then 1, then wraps
        for (i, c) in cli.bc.into_iter().enumerate() {
            s.low_battery[i % 2] = c;
        }
        s.battery = cli.bp;
        s.daemonize = cli.daemon;
        s.show_date = !cli.no_date;
        s
    }
}

// --- Glyphs ---

type Pixel = (i16, i16);

// Segments are 3 pixels long and numbered this way:
//     0
//  5     1
//     6
//  4     2
//     3
const SEGMENTS: [u8; 10] = [0x3f, 0x06, 0x5b, 0x4f, 0x66, 0x6d, 0x7d, 0x07, 0x7f, 0x6f];

const SEGMENT_RUNS: [[Pixel; 3]; 7] = [
    [(1, 0), (2, 0), (3, 0)],
    [(4, 1), (4, 2), (4, 3)],
    [(4, 5), (4, 6), (4, 7)],
    [(1, 8), (2, 8), (3, 8)],
    [(0, 5), (0, 6), (0, 7)],
    [(0, 1), (0, 2), (0, 3)],
    [(1, 4), (2, 4), (3, 4)],
];

const COLON: [Pixel; 2] = [(0, 3), (0, 5)];

const SLASH: [Pixel; 7] = [(2, 1), (2, 2), (1, 3), (1, 4), (1, 5), (0, 6), (0, 7)];

/// Appends the pixels of `c` with its top left corner at (x0, y0).
///
/// Digits are 5 wide and 9 high, ':' is a single pixel wide and '/' is 3.
/// Anything else draws nothing.
fn draw_glyph(points: &mut Vec<Pixel>, x0: i16, y0: i16, c: char) {
    let mut put = |run: &[Pixel]| points.extend(run.iter().map(|&(x, y)| (x0 + x, y0 + y)));
    match c {
        ':' => put(&COLON),
        '/' => put(&SLASH),
        '0'..='9' => {
            let mask = SEGMENTS[(c as u8 - b'0') as usize];
            for (bit, run) in SEGMENT_RUNS.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    put(run);
                }
            }
        }
        _ => {}
    }
}

fn digit(n: u32) -> char {
    (b'0' + (n % 10) as u8) as char
}

// --- Frame ---

const COLUMNS: [i16; 4] = [1, 8, 18, 25];
const TIME_Y: i16 = 1;
const WEEK_Y: i16 = 11;
const DATE_Y: i16 = 13;
const COLON_X: i16 = 15;
const SLASH_X: i16 = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ink {
    Background,
    Foreground,
    Dots,
    LowBattery(usize),
}

/// One full redraw: the window is cleared with `clear`, then each stroke
/// is drawn in order.
#[derive(Debug, PartialEq)]
struct Frame {
    clear: Ink,
    strokes: Vec<(Ink, Vec<Pixel>)>,
}

fn compose(now: &NaiveDateTime, settings: &Settings, flash: Option<usize>) -> Frame {
    let clear = flash.map_or(Ink::Background, Ink::LowBattery);

    let mut fg = Vec::new();
    let time = [now.hour() / 10, now.hour(), now.minute() / 10, now.minute()];
    for (&x, n) in COLUMNS.iter().zip(time) {
        draw_glyph(&mut fg, x, TIME_Y, digit(n));
    }

    if settings.show_date {
        let date = [now.day() / 10, now.day(), now.month() / 10, now.month()];
        for (&x, n) in COLUMNS.iter().zip(date) {
            draw_glyph(&mut fg, x, DATE_Y, digit(n));
        }
        draw_glyph(&mut fg, SLASH_X, DATE_Y, '/');

        // 4-pixel bar for the day of week, monday on the left
        let x = 1 + now.weekday().num_days_from_monday() as i16 * 4;
        fg.extend((0..4).map(|i| (x + i, WEEK_Y)));
    }

    let mut dots = Vec::new();
    if now.second() & 1 == 1 {
        draw_glyph(&mut dots, COLON_X, TIME_Y, ':');
    }
    if settings.show_date {
        // first pixel of every day, easier to count
        dots.extend((0..8).map(|i| (1 + i * 4, WEEK_Y)));
    }

    Frame { clear, strokes: vec![(Ink::Foreground, fg), (Ink::Dots, dots)] }
}

// --- Battery ---

const MAX_PATH: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Battery {
    Unknown,
    Good,
    /// Less than 10 minutes left
    Low,
    /// Less than 3 minutes left
    Critical,
}

fn battery_status(dir: Option<&Path>) -> Battery {
    dir.and_then(|dir| {
        let power = read_counter(&dir.join("power_now"))?;
        let energy = read_counter(&dir.join("energy_now"))?;
        Some(classify(power, energy))
    })
    .unwrap_or(Battery::Unknown)
}

fn classify(power: i64, energy: i64) -> Battery {
    if energy >= power * 10 / 60 {
        Battery::Good
    } else if energy >= power * 3 / 60 {
        Battery::Low
    } else {
        Battery::Critical
    }
}

fn read_counter(path: &Path) -> Option<i64> {
    if path.as_os_str().len() >= MAX_PATH {
        return None;
    }
    parse_leading_int(&fs::read_to_string(path).ok()?).map(i64::from)
}

// Same rules as scanf("%d"): skip whitespace, optional sign, digits, ignore the rest.
// Values outside i32 are rejected, so classify() can never overflow.
fn parse_leading_int(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let start = usize::from(s.starts_with(['+', '-']));
    let (digits, _) = split_digits(&s[start..]);
    if digits.is_empty() {
        return None;
    }
    s[..start + digits.len()].parse().ok()
}

/// Next flash phase and how long to sleep before the next frame.
fn next_flash(flash: Option<usize>, status: Battery) -> (Option<usize>, Duration) {
    let toggled = Some(if flash == Some(0) { 1 } else { 0 });
    match status {
        Battery::Low => (toggled, Duration::from_millis(500)),
        Battery::Critical => (toggled, Duration::from_millis(250)),
        Battery::Good | Battery::Unknown => (None, Duration::from_millis(1000)),
    }
}

// --- X11 ---

struct Palette {
    background: u32,
    foreground: u32,
    dots: u32,
    low_battery: [u32; 2],
}

impl Palette {
    fn alloc(conn: &impl Connection, cmap: Colormap, s: &Settings) -> Result<Self> {
        Ok(Self {
            background: alloc_color(conn, cmap, &s.background)?,
            foreground: alloc_color(conn, cmap, &s.foreground)?,
            dots: alloc_color(conn, cmap, &s.dots)?,
            low_battery: [
                alloc_color(conn, cmap, &s.low_battery[0])?,
                alloc_color(conn, cmap, &s.low_battery[1])?,
            ],
        })
    }

    fn pixel(&self, ink: Ink) -> u32 {
        match ink {
            Ink::Background => self.background,
            Ink::Foreground => self.foreground,
            Ink::Dots => self.dots,
            Ink::LowBattery(i) => self.low_battery[i % 2],
        }
    }
}

fn alloc_color(conn: &impl Connection, cmap: Colormap, name: &str) -> Result<u32> {
    let reply = conn
        .alloc_named_color(cmap, name.as_bytes())?
        .reply()
        .with_context(|| format!("Failed to allocate color '{name}'"))?;
    Ok(reply.pixel)
}

struct Clock<'c, C: Connection> {
    conn: &'c C,
    window: Window,
    gc: Gcontext,
    width: u16,
    height: u16,
    palette: Palette,
}

impl<'c, C: Connection> Clock<'c, C> {
    fn create(conn: &'c C, screen: &Screen, settings: &Settings) -> Result<Self> {
        // colors first: an unknown name must fail before any window exists
        let palette = Palette::alloc(conn, screen.default_colormap, settings)?;

        let x = settings.x.resolve(screen.width_in_pixels, settings.width);
        let y = settings.y.resolve(screen.height_in_pixels, settings.height);
        info!(x, y, width = settings.width, height = settings.height, "creating clock window");

        let window = conn.generate_id().context("no window id")?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            x,
            y,
            settings.width,
            settings.height,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new().override_redirect(1u32),
        )?;
        conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            b"dclock",
        )?;
        conn.map_window(window)?;

        let gc = conn.generate_id().context("no graphics context id")?;
        conn.create_gc(gc, window, &CreateGCAux::new())?;
        conn.flush()?;

        Ok(Self { conn, window, gc, width: settings.width, height: settings.height, palette })
    }

    fn set_ink(&self, ink: Ink) -> Result<()> {
        let aux = ChangeGCAux::new().foreground(self.palette.pixel(ink));
        self.conn.change_gc(self.gc, &aux)?;
        Ok(())
    }

    fn paint(&self, frame: &Frame) -> Result<()> {
        self.set_ink(frame.clear)?;
        let full = Rectangle { x: 0, y: 0, width: self.width, height: self.height };
        self.conn.poly_fill_rectangle(self.window, self.gc, &[full])?;

        for (ink, pixels) in &frame.strokes {
            if pixels.is_empty() {
                continue;
            }
            self.set_ink(*ink)?;
            let points: Vec<Point> = pixels.iter().map(|&(x, y)| Point { x, y }).collect();
            self.conn.poly_point(CoordMode::ORIGIN, self.window, self.gc, &points)?;
        }
        self.conn.flush()?;
        Ok(())
    }
}

// --- Loop ---

fn run<C: Connection>(clock: &Clock<C>, settings: &Settings) -> Result<()> {
    let mut flash = None;
    let mut last = Battery::Unknown;
    loop {
        // drain pending events one at a time; protocol errors are fatal
        if let Some(event) = clock.conn.poll_for_event()? {
            if let Event::Error(e) = event {
                bail!("XError {}, {:?}", e.error_code, e.error_kind);
            }
            continue;
        }

        let frame = compose(&Local::now().naive_local(), settings, flash);
        clock.paint(&frame)?;

        let status = battery_status(settings.battery.as_deref());
        if status != last {
            debug!(?status, "battery state changed");
            last = status;
        }
        let (next, nap) = next_flash(flash, status);
        flash = next;
        thread::sleep(nap);
    }
}

// -1 from a libc call becomes the current errno
fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn daemonize() -> Result<()> {
    if check(unsafe { libc::fork() }).context("fork failed")? != 0 {
        process::exit(0);
    }
    check(unsafe { libc::setsid() }).context("setsid failed")?;

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?
        .into_raw_fd();
    for fd in 0..3 {
        check(unsafe { libc::dup2(null, fd) })
            .with_context(|| format!("cannot redirect fd {fd} to /dev/null"))?;
    }
    if null > 2 {
        unsafe { libc::close(null) };
    }
    Ok(())
}

fn start(settings: &Settings) -> Result<()> {
    let (conn, screen_num) = x11rb::connect(None).context("Failed to open default display")?;
    let screen = &conn.setup().roots[screen_num];
    debug!(
        bg = %settings.background,
        fg = %settings.foreground,
        dc = %settings.dots,
        "screen {screen_num} is {}x{}", screen.width_in_pixels, screen.height_in_pixels
    );

    let clock = Clock::create(&conn, screen, settings)?;

    if settings.daemonize {
        debug!("detaching from terminal");
        daemonize()?;
    }
    run(&clock, settings)
}

// --- Main ---

fn init_logging(verbose: bool) {
    let filter = EnvFilter::new(if verbose { "dclock=debug" } else { "dclock=warn" });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) if !cli.help => cli,
        _ => {
            usage();
            process::exit(0);
        }
    };
    init_logging(cli.verbose);

    let settings = Settings::from(cli);
    if let Err(e) = start(&settings) {
        eprintln!("dclock: {e:#}");
        process::exit(1);
    }
}

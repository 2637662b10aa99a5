// SPDX-License-Identifier: GPL-3.0-only
//! Line-based control console for `run`
//!
//! Each stdin line is one command against the running control loop, standing
//! in for the toggles of a graphical editor.

use anyhow::{Context, Result, anyhow, bail};

use crate::config::{DisplayMode, GlassConfig, GlassId};
use crate::display::{Activation, LifecycleHandle, LifecycleState};

pub const HELP: &str = "\
commands:
  list                     show every display and its state
  register ID              create the virtual display
  activate ID              start streaming into a window
  deactivate ID            stop streaming, keep the display
  unregister ID            remove the virtual display
  close ID                 act as if the window was closed
  add [NAME]               add a display entry
  rename ID NAME           rename a display entry
  mode ID add|remove WxH[@HZ]
                           edit the display modes of an entry
  set ID FIELD VALUE       edit one field of an entry:
                             render WxH|none, render-delay SECONDS,
                             window WxH, max WxH, size-mm WxH,
                             vendor N, product N, serial N
  delete ID                delete a display entry
  auto-expiry on|off       toggle automatic unregistering
  delay SECONDS            set the automatic unregister delay
  help                     show this text
  quit                     release every display and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    List,
    Register(GlassId),
    Activate(GlassId),
    Deactivate(GlassId),
    Unregister(GlassId),
    Close(GlassId),
    Add(Option<String>),
    Rename(GlassId, String),
    AddMode(GlassId, DisplayMode),
    RemoveMode(GlassId, DisplayMode),
    Set(GlassId, Field),
    Delete(GlassId),
    AutoExpiry(bool),
    Delay(f64),
    Help,
    Quit,
}

/// One editable field of a display entry with its new value
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `None` renders at window size
    Render(Option<(u32, u32)>),
    RenderDelay(f32),
    Window(u32, u32),
    MaxResolution(u32, u32),
    SizeMillimeters(u32, u32),
    Vendor(u32),
    Product(u32),
    Serial(u32),
}

impl Field {
    fn parse(name: &str, value: &str) -> Result<Self> {
        let field = match name {
            "render" if value == "none" => Field::Render(None),
            "render" => Field::Render(Some(parse_area(value)?)),
            "render-delay" => {
                let secs: f32 = value
                    .parse()
                    .with_context(|| format!("invalid render delay {value:?}"))?;
                if !secs.is_finite() || secs < 0.0 {
                    bail!("render delay must be a non-negative number of seconds");
                }
                Field::RenderDelay(secs)
            }
            "window" => {
                let (width, height) = parse_area(value)?;
                Field::Window(width, height)
            }
            "max" => {
                let (width, height) = parse_area(value)?;
                Field::MaxResolution(width, height)
            }
            "size-mm" => {
                let (width, height) = parse_area(value)?;
                Field::SizeMillimeters(width, height)
            }
            "vendor" => Field::Vendor(parse_number(value)?),
            "product" => Field::Product(parse_number(value)?),
            "serial" => Field::Serial(parse_number(value)?),
            other => bail!("unknown field {other:?}, try help"),
        };
        Ok(field)
    }

    fn apply(self, config: &mut GlassConfig) {
        let display = &mut config.display_config;
        match self {
            Field::Render(size) => {
                config.render_width_pixels = size.map(|(w, _)| w);
                config.render_height_pixels = size.map(|(_, h)| h);
            }
            Field::RenderDelay(secs) => config.render_delay_seconds = secs,
            Field::Window(w, h) => {
                config.window_width_pixels = w;
                config.window_height_pixels = h;
            }
            Field::MaxResolution(w, h) => {
                display.max_width_pixels = w;
                display.max_height_pixels = h;
            }
            Field::SizeMillimeters(w, h) => {
                display.width_in_millimeters = w;
                display.height_in_millimeters = h;
            }
            Field::Vendor(n) => display.vendor_id = n,
            Field::Product(n) => display.product_id = n,
            Field::Serial(n) => display.serial_number = n,
        }
    }

    /// When the edit reaches a live display
    fn applies_on(&self) -> &'static str {
        match self {
            Field::Render(_) | Field::RenderDelay(_) | Field::Window(..) => "next activation",
            _ => "next registration",
        }
    }
}

/// What the console should do after a command
#[derive(Debug, PartialEq)]
pub enum Reply {
    Text(String),
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    let Some((word, rest)) = split_word(line) else {
        return Ok(None);
    };

    let id = |what: &str| -> Result<GlassId> {
        match split_word(rest) {
            Some((id, "")) => Ok(id.to_string()),
            Some(_) => bail!("{what} takes a single ID"),
            None => bail!("{what} needs an ID"),
        }
    };

    let command = match word {
        "list" | "ls" => ConsoleCommand::List,
        "register" => ConsoleCommand::Register(id("register")?),
        "activate" => ConsoleCommand::Activate(id("activate")?),
        "deactivate" => ConsoleCommand::Deactivate(id("deactivate")?),
        "unregister" => ConsoleCommand::Unregister(id("unregister")?),
        "close" => ConsoleCommand::Close(id("close")?),
        "delete" => ConsoleCommand::Delete(id("delete")?),
        "add" => ConsoleCommand::Add(Some(rest.to_string()).filter(|name| !name.is_empty())),
        "rename" => match split_word(rest) {
            Some((id, name)) if !name.is_empty() => {
                ConsoleCommand::Rename(id.to_string(), name.to_string())
            }
            _ => bail!("rename needs an ID and a name"),
        },
        "mode" => {
            let mut words = rest.split_whitespace();
            match (words.next(), words.next(), words.next(), words.next()) {
                (Some(id), Some("add"), Some(mode), None) => {
                    ConsoleCommand::AddMode(id.to_string(), parse_mode(mode)?)
                }
                (Some(id), Some("remove"), Some(mode), None) => {
                    ConsoleCommand::RemoveMode(id.to_string(), parse_mode(mode)?)
                }
                _ => bail!("usage: mode ID add|remove WxH[@HZ]"),
            }
        }
        "set" => {
            let mut words = rest.split_whitespace();
            match (words.next(), words.next(), words.next(), words.next()) {
                (Some(id), Some(name), Some(value), None) => {
                    ConsoleCommand::Set(id.to_string(), Field::parse(name, value)?)
                }
                _ => bail!("usage: set ID FIELD VALUE"),
            }
        }
        "auto-expiry" => match rest {
            "on" => ConsoleCommand::AutoExpiry(true),
            "off" => ConsoleCommand::AutoExpiry(false),
            _ => bail!("auto-expiry takes on or off"),
        },
        "delay" => {
            let secs: f64 = rest
                .parse()
                .with_context(|| format!("invalid delay {rest:?}"))?;
            ConsoleCommand::Delay(secs)
        }
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?}, try help"),
    };
    Ok(Some(command))
}

/// `1920x1080` or `1920x1080@59.94`; the rate defaults to 60 Hz
fn parse_mode(s: &str) -> Result<DisplayMode> {
    let (size, rate) = match s.split_once('@') {
        Some((size, rate)) => {
            let rate = rate
                .parse()
                .with_context(|| format!("invalid refresh rate {rate:?}"))?;
            (size, rate)
        }
        None => (s, DisplayMode::default().refresh_rate_hz),
    };
    let (width_pixels, height_pixels) = parse_area(size)?;
    Ok(DisplayMode {
        width_pixels,
        height_pixels,
        refresh_rate_hz: rate,
    })
}

/// Non-zero `WxH`
fn parse_area(s: &str) -> Result<(u32, u32)> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("invalid size {s:?}, expected WxH"))?;
    let width: u32 = width.parse().with_context(|| format!("invalid width {width:?}"))?;
    let height: u32 = height
        .parse()
        .with_context(|| format!("invalid height {height:?}"))?;
    if width == 0 || height == 0 {
        bail!("size {s:?} is empty");
    }
    Ok((width, height))
}

fn parse_number(s: &str) -> Result<u32> {
    s.parse().with_context(|| format!("invalid number {s:?}"))
}

fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((s, "")),
    }
}

pub async fn execute(handle: &LifecycleHandle, command: ConsoleCommand) -> Result<Reply> {
    let text = match command {
        ConsoleCommand::List => listing(handle).await?,
        ConsoleCommand::Register(id) => {
            let info = handle.register(id).await?;
            format!("{} registered as display {}", info.id, info.display_id)
        }
        ConsoleCommand::Activate(id) => {
            if handle.state(id.clone()).await? == LifecycleState::Unregistered {
                handle.register(id.clone()).await?;
            }
            match handle.activate(id.clone()).await? {
                Activation::Started => format!("{id} active"),
                Activation::AlreadyActive => format!("{id} was already active"),
            }
        }
        ConsoleCommand::Deactivate(id) => match handle.deactivate(id.clone()).await? {
            true => format!("{id} deactivated"),
            false => format!("{id} was not active"),
        },
        ConsoleCommand::Unregister(id) => match handle.unregister(id.clone()).await? {
            true => format!("{id} unregistered"),
            false => format!("{id} was not registered"),
        },
        ConsoleCommand::Close(id) => {
            handle.presentation_closed(id.clone()).await?;
            format!("closed the window of {id}")
        }
        ConsoleCommand::Add(name) => {
            let config = handle.add_config(name).await?;
            format!("added {} ({})", config.id, config.window_title(None))
        }
        ConsoleCommand::Rename(id, name) => {
            edit(handle, &id, |config| config.name = Some(name)).await?;
            format!("renamed {id}")
        }
        ConsoleCommand::AddMode(id, mode) => {
            edit(handle, &id, |config| config.display_config.add_mode(mode)).await?;
            format!("added mode to {id}, re-register to apply")
        }
        ConsoleCommand::RemoveMode(id, mode) => {
            let mut removed = false;
            edit(handle, &id, |config| {
                removed = config.display_config.remove_mode(&mode);
            })
            .await?;
            if !removed {
                bail!("{id} has no such mode");
            }
            format!("removed mode from {id}, re-register to apply")
        }
        ConsoleCommand::Set(id, field) => {
            let applies_on = field.applies_on();
            edit(handle, &id, |config| field.apply(config)).await?;
            format!("updated {id}, applies on {applies_on}")
        }
        ConsoleCommand::Delete(id) => {
            handle.delete_config(id.clone()).await?;
            format!("deleted {id}")
        }
        ConsoleCommand::AutoExpiry(enabled) => {
            let mut settings = handle.settings().await?;
            settings.automatic_unregister_enabled = enabled;
            handle.set_settings(settings).await?;
            format!("automatic unregister {}", if enabled { "on" } else { "off" })
        }
        ConsoleCommand::Delay(secs) => {
            let mut settings = handle.settings().await?;
            settings.automatic_unregister_delay_in_seconds = secs;
            handle.set_settings(settings).await?;
            format!("automatic unregister delay {secs}s")
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => return Ok(Reply::Quit),
    };
    Ok(Reply::Text(text))
}

/// Fetch an entry, change it and hand it back to the controller
async fn edit(
    handle: &LifecycleHandle,
    id: &str,
    change: impl FnOnce(&mut GlassConfig),
) -> Result<()> {
    let mut config = handle
        .configs()
        .await?
        .into_iter()
        .find(|config| config.id == id)
        .ok_or_else(|| anyhow!("no display entry {id}"))?;
    change(&mut config);
    handle.update_config(config).await?;
    Ok(())
}

async fn listing(handle: &LifecycleHandle) -> Result<String> {
    let mut lines = Vec::new();
    for config in handle.configs().await? {
        let state = handle.state(config.id.clone()).await?;
        lines.push(format!(
            "{:<24} {:<12} {}",
            config.id,
            format!("{state:?}").to_lowercase(),
            config.window_title(None)
        ));
    }
    Ok(lines.join("\n"))
}

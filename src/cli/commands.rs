use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use clap::Args;
use time::OffsetDateTime;

use crate::app::{App, MonthView};
use crate::calendar::DayKey;
use crate::store::{DeleteOutcome, MessageRecord};

#[derive(Args, Debug, Clone, Default)]
pub struct MonthArgs {
    /// Year to show (defaults to the current one)
    #[arg(long, allow_negative_numbers = true)]
    pub year: Option<i32>,
    /// Month to show, 1-12 (defaults to the current one)
    #[arg(long)]
    pub month: Option<i32>,
    /// Move this many months forward (negative for backward)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub offset: i32,
}

#[derive(Args, Debug, Clone)]
pub struct DayArgs {
    /// Day as YYYY-MM-DD or "today"
    #[arg(value_parser = parse_day)]
    pub date: DayKey,
}

#[derive(Args, Debug, Clone)]
pub struct WriteArgs {
    /// Day as YYYY-MM-DD or "today"
    #[arg(value_parser = parse_day)]
    pub date: DayKey,
    /// Note text, up to 200 characters
    #[arg(required = true, num_args = 1..)]
    pub text: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Day as YYYY-MM-DD or "today"
    #[arg(value_parser = parse_day)]
    pub date: DayKey,
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

pub fn parse_day(raw: &str) -> Result<DayKey, String> {
    if raw.eq_ignore_ascii_case("today") {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        return Ok(DayKey::from_date(now.date()));
    }
    raw.parse::<DayKey>().map_err(|err| err.to_string())
}

pub fn show_month(app: &mut App, args: MonthArgs, out: &mut impl Write) -> Result<()> {
    let nav = app.navigation_mut();
    if args.year.is_some() || args.month.is_some() {
        let year = args.year.unwrap_or(nav.year());
        let month = args.month.unwrap_or(i32::from(nav.month()));
        if !(1..=12).contains(&month) {
            bail!("month must be between 1 and 12, got {month}");
        }
        nav.jump(year, month - 1);
    }
    nav.shift(args.offset);
    render_month(&app.month_view(), out)?;
    Ok(())
}

pub fn show_day(app: &App, args: DayArgs, out: &mut impl Write) -> Result<()> {
    match app.message(args.date) {
        Some(record) => write_record(&args.date, record, app.user_id(), out)?,
        None => writeln!(out, "{}: no note", args.date.display_short())?,
    }
    Ok(())
}

pub fn add_message(app: &mut App, args: WriteArgs, out: &mut impl Write) -> Result<()> {
    let text = args.text.join(" ");
    let key = app
        .add(args.date, &text)
        .with_context(|| format!("adding a note for {}", args.date))?;
    writeln!(out, "Saved note for {}", key.display_short())?;
    Ok(())
}

pub fn edit_message(app: &mut App, args: WriteArgs, out: &mut impl Write) -> Result<()> {
    let text = args.text.join(" ");
    app.edit(args.date, &text)
        .with_context(|| format!("editing the note for {}", args.date))?;
    writeln!(out, "Updated note for {}", args.date.display_short())?;
    Ok(())
}

/// Deletes after asking on the terminal, unless `--yes` was given. Refuses
/// to prompt when stdin is not a terminal.
pub fn delete_message(app: &mut App, args: DeleteArgs, out: &mut impl Write) -> Result<()> {
    let interactive = atty::is(atty::Stream::Stdin);
    let mut refused = false;
    let outcome = app
        .remove(args.date, |key, record| {
            if args.yes {
                return true;
            }
            if !interactive {
                refused = true;
                return false;
            }
            let stdin = io::stdin();
            prompt_delete(key, record, &mut stdin.lock(), &mut io::stderr()).unwrap_or_else(
                |err| {
                    tracing::warn!(?err, "could not read confirmation");
                    false
                },
            )
        })
        .with_context(|| format!("deleting the note for {}", args.date))?;
    if refused {
        bail!("stdin is not a terminal; pass --yes to delete without confirmation");
    }
    match outcome {
        DeleteOutcome::Deleted => writeln!(out, "Deleted note for {}", args.date.display_short())?,
        DeleteOutcome::Declined => writeln!(out, "Kept note for {}", args.date.display_short())?,
    }
    Ok(())
}

pub fn whoami(app: &App, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{} ({} storage)", app.user_id(), app.mode())?;
    Ok(())
}

/// Asks a y/N question; anything but "y" or "yes" declines.
pub fn prompt_delete(
    key: &DayKey,
    record: &MessageRecord,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> Result<bool> {
    write!(
        prompt,
        "Delete the note for {} (\"{}\")? [y/N] ",
        key.display_short(),
        record.text
    )?;
    prompt.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

pub fn render_month(view: &MonthView, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", view.label)?;
    writeln!(out, " Su  Mo  Tu  We  Th  Fr  Sa")?;
    let mut line = "    ".repeat(usize::from(view.leading_blanks));
    let mut column = usize::from(view.leading_blanks);
    for cell in &view.days {
        let marker = match (&cell.message, cell.own) {
            (Some(_), true) => '*',
            (Some(_), false) => '+',
            (None, _) => ' ',
        };
        line.push_str(&format!("{:>3}{marker}", cell.day));
        column += 1;
        if column % 7 == 0 {
            writeln!(out, "{}", line.trim_end())?;
            line.clear();
        }
    }
    if !line.is_empty() {
        writeln!(out, "{}", line.trim_end())?;
    }

    let mut filled = view.filled().peekable();
    if filled.peek().is_some() {
        writeln!(out)?;
    }
    for cell in filled {
        if let Some(record) = &cell.message {
            let edited = if record.edited { " (edited)" } else { "" };
            writeln!(out, "{:>2}  {}{edited}", cell.day, record.text)?;
        }
    }
    Ok(())
}

fn write_record(
    key: &DayKey,
    record: &MessageRecord,
    user_id: &str,
    out: &mut impl Write,
) -> Result<()> {
    writeln!(out, "{}: {}", key.display_short(), record.text)?;
    let author = if record.is_authored_by(user_id) {
        "you"
    } else {
        record.author_id.as_str()
    };
    let when = record
        .timestamp
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| record.timestamp.to_string());
    let edited = if record.edited { ", edited" } else { "" };
    writeln!(out, "  by {author} at {when}{edited}")?;
    Ok(())
}

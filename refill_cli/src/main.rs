use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use refill_core::calendar;
use refill_core::dispatch::{due_notifications, pending_notifications};
use refill_core::*;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "refill")]
#[command(about = "Medication supply tracker and refill reminders", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pretend the current time is this RFC 3339 instant
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a new prescription and schedule its reminders
    Add {
        /// Medication name
        #[arg(long)]
        name: String,

        /// Units taken per dose
        #[arg(long, default_value_t = 1)]
        dosage: u32,

        /// Take a dose every N units of time
        #[arg(long, default_value_t = 1)]
        every: i64,

        /// Unit for --every (minutes, hours, days, weeks)
        #[arg(long, default_value = "days")]
        unit: IntervalUnit,

        /// Units on hand
        #[arg(long, required_unless_present = "supply_days", conflicts_with = "supply_days")]
        supply: Option<u32>,

        /// Size the supply as a 30, 60, 90 or 100 day fill
        #[arg(long)]
        supply_days: Option<SupplyClass>,

        #[command(flatten)]
        start: StartArgs,

        #[command(flatten)]
        reminders: ReminderArgs,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Change a prescription; schedule changes restart the refill cycle
    Edit {
        /// Prescription id or unique prefix
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        dosage: Option<u32>,

        #[arg(long)]
        every: Option<i64>,

        #[arg(long, requires = "every")]
        unit: Option<IntervalUnit>,

        #[arg(long)]
        supply: Option<u32>,

        #[command(flatten)]
        start: StartArgs,

        #[command(flatten)]
        reminders: ReminderArgs,

        /// Replace the notes; an empty string clears them
        #[arg(long)]
        notes: Option<String>,
    },

    /// Toggle whether the current supply has been refilled
    Refill {
        id: String,

        /// Mark as refilled instead of toggling
        #[arg(long, conflicts_with = "undo")]
        done: bool,

        /// Mark as not yet refilled instead of toggling
        #[arg(long)]
        undo: bool,
    },

    /// Stop tracking a prescription and cancel its reminders
    Delete { id: String },

    /// List prescriptions
    List,

    /// Show one prescription with its reminder plan
    Show { id: String },

    /// Upcoming reminders and run-out dates
    Calendar {
        /// How far ahead to look
        #[arg(long, default_value_t = 30)]
        days: i64,

        /// Also export the entries to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Print notifications that are due and mark them delivered
    Due {
        /// Leave them pending
        #[arg(long)]
        peek: bool,
    },

    /// Re-register reminders for every prescription awaiting refill and compact the outbox
    Restore,

    /// Copy the prescription store to a file
    Backup { dest: PathBuf },
}

#[derive(Args)]
struct StartArgs {
    /// Date of the first dose (YYYY-MM-DD)
    #[arg(long, conflicts_with = "start_time")]
    start_date: Option<NaiveDate>,

    /// Time of the first dose (RFC 3339), for sub-day dosing
    #[arg(long)]
    start_time: Option<DateTime<Utc>>,
}

impl StartArgs {
    fn given(&self) -> bool {
        self.start_date.is_some() || self.start_time.is_some()
    }
}

#[derive(Args)]
struct ReminderArgs {
    /// Warn this many units before running out
    #[arg(long)]
    remind_before: Option<i64>,

    #[arg(long, requires = "remind_before")]
    remind_unit: Option<IntervalUnit>,

    /// Follow-up reminders after the first warning
    #[arg(long)]
    follow_ups: Option<u32>,

    /// Spacing between follow-ups
    #[arg(long)]
    follow_up_every: Option<i64>,

    #[arg(long, requires = "follow_up_every")]
    follow_up_unit: Option<IntervalUnit>,
}

impl ReminderArgs {
    fn given(&self) -> bool {
        self.remind_before.is_some() || self.follow_ups.is_some() || self.follow_up_every.is_some()
    }

    /// Apply the flags on top of configured defaults
    fn resolve(&self, defaults: &config::ReminderDefaults) -> Result<ReminderPreferences> {
        ReminderPreferences::from_units(
            self.remind_before.unwrap_or(defaults.primary_offset),
            self.remind_unit.unwrap_or(defaults.primary_unit),
            self.follow_ups.unwrap_or(defaults.secondary_count),
            Some((
                self.follow_up_every.unwrap_or(defaults.secondary_every),
                self.follow_up_unit.unwrap_or(defaults.secondary_unit),
            )),
        )
    }

    /// Apply the flags on top of a prescription's current preferences
    fn merge(&self, current: &ReminderPreferences) -> Result<ReminderPreferences> {
        // An amount without a unit keeps the unit of the interval it replaces.
        let interval_or = |amount: Option<i64>, unit: Option<IntervalUnit>, fallback: Option<Interval>| {
            match amount {
                Some(n) => Interval::new(
                    n,
                    unit.or(fallback.map(|i| i.unit())).unwrap_or(IntervalUnit::Days),
                )
                    .map(Some)
                    .map_err(|e| Error::InvalidReminderConfig(e.to_string())),
                None => Ok(fallback),
            }
        };

        let primary = interval_or(self.remind_before, self.remind_unit, Some(current.primary_offset))?
            .unwrap_or(current.primary_offset);
        let count = self.follow_ups.unwrap_or(current.secondary_count);
        let spacing = interval_or(
            self.follow_up_every,
            self.follow_up_unit,
            current.secondary_interval,
        )?;

        if count == 0 {
            return Ok(ReminderPreferences::primary_only(primary));
        }
        ReminderPreferences::new(primary, count, spacing)
    }
}

type Coordinator = SchedulingCoordinator<JsonFileStore, JsonlOutbox>;

fn main() -> Result<()> {
    // Initialize logging
    refill_core::logging::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| config.data.data_dir.clone());
    let now = cli.now.unwrap_or_else(Utc::now);

    let ctx = Context::open(data_dir, &config);

    match cli.command {
        Some(Commands::Add {
            name,
            dosage,
            every,
            unit,
            supply,
            supply_days,
            start,
            reminders,
            notes,
        }) => {
            let interval = Interval::new(every, unit)?;
            let supply_count = match (supply, supply_days) {
                (Some(count), _) => count,
                (None, Some(class)) => class.units_for(dosage, interval)?,
                (None, None) => return Err(Error::InvalidSupply("a supply is required".into())),
            };
            let start = if start.given() {
                StartAnchor::from_parts(start.start_date, start.start_time)?
            } else {
                StartAnchor::OnDate {
                    date: now.date_naive(),
                }
            };
            let draft = PrescriptionDraft {
                name,
                dosage_per_interval: dosage,
                interval,
                supply_count,
                start,
                reminders: reminders.resolve(&config.reminders)?,
                notes,
            };
            cmd_add(&ctx, draft, now)
        }
        Some(Commands::Edit {
            id,
            name,
            dosage,
            every,
            unit,
            supply,
            start,
            reminders,
            notes,
        }) => {
            let id = ctx.resolve_id(&id)?;
            let current = ctx.coordinator.get(id)?;
            let edit = PrescriptionEdit {
                name,
                dosage_per_interval: dosage,
                interval: every
                    .map(|n| Interval::new(n, unit.unwrap_or(IntervalUnit::Days)))
                    .transpose()?,
                supply_count: supply,
                start: if start.given() {
                    Some(StartAnchor::from_parts(start.start_date, start.start_time)?)
                } else {
                    None
                },
                reminders: if reminders.given() {
                    Some(reminders.merge(&current.prescription.reminders)?)
                } else {
                    None
                },
                notes,
            };
            cmd_edit(&ctx, id, &edit, now)
        }
        Some(Commands::Refill { id, done, undo }) => {
            let id = ctx.resolve_id(&id)?;
            let status = match (done, undo) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_refill(&ctx, id, status, now)
        }
        Some(Commands::Delete { id }) => {
            let id = ctx.resolve_id(&id)?;
            cmd_delete(&ctx, id)
        }
        Some(Commands::Show { id }) => {
            let id = ctx.resolve_id(&id)?;
            cmd_show(&ctx, id, now)
        }
        Some(Commands::Calendar { days, csv }) => cmd_calendar(&ctx, days, csv.as_deref(), now),
        Some(Commands::Due { peek }) => cmd_due(&ctx, peek, now),
        Some(Commands::Restore) => cmd_restore(&ctx, now),
        Some(Commands::Backup { dest }) => cmd_backup(&ctx, &dest),
        Some(Commands::List) | None => cmd_list(&ctx, now),
    }
}

/// Storage, outbox and coordinator for one data directory
struct Context {
    outbox_path: PathBuf,
    coordinator: Coordinator,
}

impl Context {
    fn open(data_dir: PathBuf, config: &Config) -> Self {
        let data = config::DataConfig { data_dir };
        let outbox_path = data.outbox_path();
        let coordinator = SchedulingCoordinator::new(
            JsonFileStore::new(data.store_path()),
            JsonlOutbox::new(&outbox_path),
            config.dispatch.clone(),
        );
        Self {
            outbox_path,
            coordinator,
        }
    }

    /// Accept a full id or an unambiguous prefix of one
    fn resolve_id(&self, input: &str) -> Result<Uuid> {
        if let Ok(id) = input.parse::<Uuid>() {
            return Ok(id);
        }

        let prefix = input.trim().to_lowercase();
        let matches: Vec<Uuid> = self
            .coordinator
            .list()?
            .iter()
            .map(|r| r.id())
            .filter(|id| !prefix.is_empty() && id.to_string().starts_with(&prefix))
            .collect();

        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(Error::Other(format!("No prescription matches '{}'", input))),
            _ => Err(Error::Other(format!(
                "'{}' matches {} prescriptions; use a longer prefix",
                input,
                matches.len()
            ))),
        }
    }
}

fn cmd_add(ctx: &Context, draft: PrescriptionDraft, now: DateTime<Utc>) -> Result<()> {
    let record = ctx.coordinator.create(draft, now)?;

    println!("✓ Tracking {}", record.prescription.name);
    println!("  Id: {}", record.id());
    println!("  Runs out: {}", format_instant(record.depletion));
    print_plan(&record, now);
    Ok(())
}

fn cmd_edit(ctx: &Context, id: Uuid, edit: &PrescriptionEdit, now: DateTime<Utc>) -> Result<()> {
    if edit.is_empty() {
        println!("Nothing to change.");
        return Ok(());
    }

    let record = ctx.coordinator.edit(id, edit, now)?;
    println!("✓ Updated {}", record.prescription.name);
    if edit.changes_schedule() {
        println!("  Runs out: {}", format_instant(record.depletion));
        print_plan(&record, now);
    }
    Ok(())
}

fn cmd_refill(ctx: &Context, id: Uuid, status: Option<bool>, now: DateTime<Utc>) -> Result<()> {
    let record = match status {
        Some(refilled) => ctx.coordinator.set_refill_status(id, refilled, now)?,
        None => ctx.coordinator.toggle_refill(id, now)?,
    };

    if record.prescription.refill_status() {
        println!(
            "✓ {} marked as refilled; reminders cancelled",
            record.prescription.name
        );
    } else {
        println!(
            "✓ {} awaiting refill; reminders scheduled",
            record.prescription.name
        );
    }
    Ok(())
}

fn cmd_delete(ctx: &Context, id: Uuid) -> Result<()> {
    let record = ctx.coordinator.get(id)?;
    ctx.coordinator.delete(id)?;
    println!("✓ Deleted {}", record.prescription.name);
    Ok(())
}

fn cmd_list(ctx: &Context, now: DateTime<Utc>) -> Result<()> {
    let records = ctx.coordinator.list()?;
    if records.is_empty() {
        println!("No prescriptions tracked yet. Add one with `refill add`.");
        return Ok(());
    }

    for record in &records {
        let p = &record.prescription;
        let status = match p.refill_state {
            RefillState::Active => "awaiting refill",
            RefillState::Acknowledged => "refilled",
        };
        println!(
            "{}  {:<20} runs out {}  ({})",
            short_id(record.id()),
            p.name,
            format_instant(record.depletion),
            status
        );
        if let Some(next) = next_reminder(record, now) {
            println!("          next reminder {}", format_instant(next));
        }
    }
    Ok(())
}

fn cmd_show(ctx: &Context, id: Uuid, now: DateTime<Utc>) -> Result<()> {
    let record = ctx.coordinator.get(id)?;
    let p = &record.prescription;

    println!("\n  {}", p.name);
    println!("  Id:        {}", p.id);
    println!("  Dose:      {} every {}", p.dosage_per_interval, p.interval);
    println!("  Supply:    {} units", p.supply_count);
    println!("  Started:   {}", p.start);
    println!("  Runs out:  {}", format_instant(record.depletion));
    println!("  Status:    {} (cycle {})", p.refill_state, p.cycle);
    if let Some(ref notes) = p.notes {
        println!("  Notes:     {}", notes);
    }
    print_plan(&record, now);
    println!();
    Ok(())
}

fn cmd_calendar(ctx: &Context, days: i64, csv: Option<&Path>, now: DateTime<Utc>) -> Result<()> {
    let until = Duration::try_days(days)
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| Error::OutOfRange(format!("{} days ahead", days)))?;

    let entries = calendar::upcoming(&ctx.coordinator.list()?, now, until);
    if entries.is_empty() {
        println!("Nothing scheduled in the next {} days.", days);
    }
    for entry in &entries {
        println!("{}  {:<10} {}", format_instant(entry.at), entry.event, entry.name);
    }

    if let Some(path) = csv {
        let count = calendar::write_csv(&entries, path)?;
        println!("✓ Exported {} entries to {}", count, path.display());
    }
    Ok(())
}

fn cmd_due(ctx: &Context, peek: bool, now: DateTime<Utc>) -> Result<()> {
    let due = due_notifications(&ctx.outbox_path, now)?;
    if due.is_empty() {
        let pending = pending_notifications(&ctx.outbox_path)?;
        match pending.first() {
            Some(next) => println!("Nothing due. Next reminder {}.", format_instant(next.fire_at)),
            None => println!("Nothing due."),
        }
        return Ok(());
    }

    for notification in &due {
        println!("🔔 {}", notification.message);
        if !peek {
            // Cancelled or delivered by another process in the meantime
            if let Err(e) = ctx
                .coordinator
                .dispatcher()
                .mark_delivered(notification.prescription_id, notification.reminder_id)
            {
                tracing::warn!("Could not mark {} delivered: {}", notification.reminder_id, e);
            }
        }
    }
    Ok(())
}

fn cmd_restore(ctx: &Context, now: DateTime<Utc>) -> Result<()> {
    let restored = ctx.coordinator.restore(now)?;
    let dropped = ctx.coordinator.dispatcher().compact()?;
    println!("✓ Restored reminders for {} prescriptions", restored);
    if dropped > 0 {
        println!("  Dropped {} retired outbox entries", dropped);
    }
    Ok(())
}

fn cmd_backup(ctx: &Context, dest: &Path) -> Result<()> {
    let count = ctx.coordinator.store().backup(dest)?;
    println!("✓ Backed up {} prescriptions to {}", count, dest.display());
    Ok(())
}

fn print_plan(record: &PrescriptionRecord, now: DateTime<Utc>) {
    if record.prescription.refill_status() {
        println!("  Reminders: none (refilled)");
        return;
    }

    println!("  Reminders:");
    for reminder in &record.plan.reminders {
        let label = match reminder.kind {
            ReminderKind::Primary => "refill",
            ReminderKind::Secondary => "follow-up",
        };
        let past = if reminder.fire_at <= now { " (past)" } else { "" };
        println!("    → {} {}{}", format_instant(reminder.fire_at), label, past);
    }
}

fn next_reminder(record: &PrescriptionRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if record.prescription.refill_status() {
        return None;
    }
    record
        .plan
        .reminders
        .iter()
        .map(|r| r.fire_at)
        .find(|at| *at > now)
}

fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

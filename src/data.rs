use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Calendar date (`YYYY-MM-DD`) in the local timezone.
pub type DayKey = String;

pub type DayMap<T> = BTreeMap<DayKey, T>;

/// Samples of one day keyed by their epoch-seconds string.
pub type PointSeries<V> = BTreeMap<String, V>;

// ── Categories ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "sleep")]
    Sleep,
    #[serde(rename = "heart")]
    HeartRate,
    #[serde(rename = "steps")]
    Steps,
    #[serde(rename = "weight")]
    Weight,
    #[serde(rename = "exercise")]
    Exercise,
    #[serde(rename = "oxygen")]
    OxygenSaturation,
    #[serde(rename = "hydration")]
    Hydration,
    #[serde(rename = "calories")]
    TotalCalories,
    #[serde(rename = "temperature")]
    BodyTemperature,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Sleep,
        Category::HeartRate,
        Category::Steps,
        Category::Weight,
        Category::Exercise,
        Category::OxygenSaturation,
        Category::Hydration,
        Category::TotalCalories,
        Category::BodyTemperature,
    ];

    /// Key used in the snapshot and in the settings file.
    pub fn key(&self) -> &'static str {
        match self {
            Category::Sleep => "sleep",
            Category::HeartRate => "heart",
            Category::Steps => "steps",
            Category::Weight => "weight",
            Category::Exercise => "exercise",
            Category::OxygenSaturation => "oxygen",
            Category::Hydration => "hydration",
            Category::TotalCalories => "calories",
            Category::BodyTemperature => "temperature",
        }
    }

    /// Tag reported in `unavailable` when the category yields nothing.
    /// Steps and weight are left null without a tag.
    pub fn unavailable_reason(&self) -> Option<&'static str> {
        match self {
            Category::Sleep => Some("sleep"),
            Category::HeartRate => Some("heart rate"),
            Category::Exercise => Some("exercise"),
            Category::OxygenSaturation => Some("oxygen saturation"),
            Category::Hydration => Some("hydration record"),
            Category::TotalCalories => Some("total calories"),
            Category::BodyTemperature => Some("body temperature"),
            Category::Steps | Category::Weight => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown category '{0}' (expected one of: sleep, heart, steps, weight, exercise, oxygen, hydration, calories, temperature)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.key() == wanted)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ── Sleep records ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStageType {
    Unknown,
    Awake,
    Sleeping,
    OutOfBed,
    Light,
    Deep,
    Rem,
    AwakeInBed,
}

impl SleepStageType {
    /// Numeric stage code used by the platform health store.
    pub fn code(&self) -> i32 {
        match self {
            SleepStageType::Unknown => 0,
            SleepStageType::Awake => 1,
            SleepStageType::Sleeping => 2,
            SleepStageType::OutOfBed => 3,
            SleepStageType::Light => 4,
            SleepStageType::Deep => 5,
            SleepStageType::Rem => 6,
            SleepStageType::AwakeInBed => 7,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SleepStageType::Awake => "Awake",
            SleepStageType::Sleeping => "Sleep",
            SleepStageType::Deep => "Deep Sleep",
            SleepStageType::Light => "Light Sleep",
            SleepStageType::Rem => "REM",
            SleepStageType::OutOfBed => "Out of bed",
            SleepStageType::AwakeInBed => "Awake in bed",
            SleepStageType::Unknown => "Unknown",
        }
    }

    pub fn is_awake(&self) -> bool {
        matches!(
            self,
            SleepStageType::Awake | SleepStageType::OutOfBed | SleepStageType::AwakeInBed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepStage {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stage: SleepStageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub stages: Vec<SleepStage>,
}

// ── Point samples ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub time: DateTime<Utc>,
    pub bpm: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub time: DateTime<Utc>,
    pub kilograms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OxygenSaturationRecord {
    pub time: DateTime<Utc>,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyTemperatureRecord {
    pub time: DateTime<Utc>,
    pub celsius: f64,
}

// ── Interval records ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydrationRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub volume_ml: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaloriesRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_kcal: f64,
}

// ── Exercise records ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSession {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exercise_type: i32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub segments: Vec<ExerciseSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub repetitions: i32,
    pub segment_type: i32,
}

/// Display name for a platform exercise-type code.
pub fn exercise_name(code: i32) -> &'static str {
    match code {
        0 => "Other Workout",
        2 => "Badminton",
        4 => "Baseball",
        5 => "Basketball",
        8 => "Biking",
        9 => "Stationary Biking",
        10 => "Boot Camp",
        11 => "Boxing",
        13 => "Calisthenics",
        14 => "Cricket",
        16 => "Dancing",
        25 => "Elliptical",
        26 => "Exercise Class",
        27 => "Fencing",
        28 => "American Football",
        29 => "Australian Football",
        31 => "Frisbee/Disc",
        32 => "Golf",
        33 => "Guided Breathing",
        34 => "Gymnastics",
        35 => "Handball",
        36 => "HIIT",
        37 => "Hiking",
        38 => "Ice Hockey",
        39 => "Ice Skating",
        44 => "Martial Arts",
        46 => "Paddling",
        47 => "Paragliding",
        48 => "Pilates",
        50 => "Racquetball",
        51 => "Rock Climbing",
        52 => "Roller Hockey",
        53 => "Rowing",
        54 => "Rowing Machine",
        55 => "Rugby",
        56 => "Running",
        57 => "Treadmill Running",
        58 => "Sailing",
        59 => "Scuba Diving",
        60 => "Skating",
        61 => "Skiing",
        62 => "Snowboarding",
        63 => "Snowshoeing",
        64 => "Soccer",
        65 => "Softball",
        66 => "Squash",
        68 => "Stair Climbing",
        69 => "Stair Climbing Machine",
        70 => "Strength Training",
        71 => "Stretching",
        72 => "Surfing",
        73 => "Open Water Swimming",
        74 => "Pool Swimming",
        75 => "Table Tennis",
        76 => "Tennis",
        78 => "Volleyball",
        79 => "Walking",
        80 => "Water Polo",
        81 => "Weightlifting",
        82 => "Wheelchair",
        83 => "Yoga",
        _ => "Unknown",
    }
}

// ── Source batches ──────────────────────────────────────

/// Records of a single category returned by a source query.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    Sleep(Vec<SleepSession>),
    HeartRate(Vec<HeartRateSample>),
    Steps(Vec<StepsRecord>),
    Weight(Vec<WeightRecord>),
    Exercise(Vec<ExerciseSession>),
    OxygenSaturation(Vec<OxygenSaturationRecord>),
    Hydration(Vec<HydrationRecord>),
    TotalCalories(Vec<CaloriesRecord>),
    BodyTemperature(Vec<BodyTemperatureRecord>),
}

impl RecordBatch {
    pub fn category(&self) -> Category {
        match self {
            RecordBatch::Sleep(_) => Category::Sleep,
            RecordBatch::HeartRate(_) => Category::HeartRate,
            RecordBatch::Steps(_) => Category::Steps,
            RecordBatch::Weight(_) => Category::Weight,
            RecordBatch::Exercise(_) => Category::Exercise,
            RecordBatch::OxygenSaturation(_) => Category::OxygenSaturation,
            RecordBatch::Hydration(_) => Category::Hydration,
            RecordBatch::TotalCalories(_) => Category::TotalCalories,
            RecordBatch::BodyTemperature(_) => Category::BodyTemperature,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Sleep(r) => r.len(),
            RecordBatch::HeartRate(r) => r.len(),
            RecordBatch::Steps(r) => r.len(),
            RecordBatch::Weight(r) => r.len(),
            RecordBatch::Exercise(r) => r.len(),
            RecordBatch::OxygenSaturation(r) => r.len(),
            RecordBatch::Hydration(r) => r.len(),
            RecordBatch::TotalCalories(r) => r.len(),
            RecordBatch::BodyTemperature(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Day summaries ───────────────────────────────────────

/// Accumulated amount for one day of a counting category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayTotal<T> {
    pub start_time: i64,
    pub end_time: i64,
    pub total: T,
    pub formatted_total: String,
    pub records: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRatePoint {
    pub time: i64,
    pub bpm: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSpan {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepStageBreakdown {
    pub stage: SleepStageType,
    pub stage_label: String,
    pub total_duration_seconds: i64,
    pub total_duration_formatted: String,
    pub occurrence_count: u32,
    pub percentage_of_day: f64,
    pub session_list: Vec<IntervalSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepDay {
    pub start_time: i64,
    pub end_time: i64,
    pub sessions: u32,
    /// Time in bed, never less than the sum of the stage durations.
    pub total_duration: i64,
    pub total_duration_formatted: String,
    pub asleep_duration: i64,
    pub asleep_duration_formatted: String,
    pub awake_duration: i64,
    pub sleep_percentage: f64,
    pub stages: Vec<SleepStageBreakdown>,
}

impl SleepDay {
    pub fn stage(&self, stage: SleepStageType) -> Option<&SleepStageBreakdown> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Sleep per day plus the synthetic `lastSleep` entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SleepSummary {
    #[serde(rename = "lastSleep", default, skip_serializing_if = "Option::is_none")]
    pub last_sleep: Option<SleepDay>,
    #[serde(flatten)]
    pub days: DayMap<SleepDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEntry {
    pub start_time: i64,
    pub end_time: i64,
    pub repetitions: i32,
    pub segment_type: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseEntry {
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub duration_formatted: String,
    pub exercise_type: i32,
    pub exercise_name: String,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub segments: Vec<SegmentEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseTypeBreakdown {
    pub exercise_type: i32,
    pub exercise_name: String,
    pub total_duration_seconds: i64,
    pub total_duration_formatted: String,
    pub occurrence_count: u32,
    pub percentage_of_day: f64,
    pub session_list: Vec<ExerciseEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseDay {
    pub start_time: i64,
    pub end_time: i64,
    pub total_sessions: u32,
    pub total_duration: i64,
    pub total_duration_formatted: String,
    pub types: Vec<ExerciseTypeBreakdown>,
}

// ── Snapshot ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CategorySummary {
    Sleep(SleepSummary),
    HeartRate(DayMap<PointSeries<HeartRatePoint>>),
    Steps(DayMap<DayTotal<i64>>),
    Weight(DayMap<PointSeries<f64>>),
    Exercise(DayMap<ExerciseDay>),
    OxygenSaturation(DayMap<PointSeries<f64>>),
    Hydration(DayMap<DayTotal<f64>>),
    TotalCalories(DayMap<DayTotal<f64>>),
    BodyTemperature(DayMap<PointSeries<f64>>),
}

impl CategorySummary {
    pub fn category(&self) -> Category {
        match self {
            CategorySummary::Sleep(_) => Category::Sleep,
            CategorySummary::HeartRate(_) => Category::HeartRate,
            CategorySummary::Steps(_) => Category::Steps,
            CategorySummary::Weight(_) => Category::Weight,
            CategorySummary::Exercise(_) => Category::Exercise,
            CategorySummary::OxygenSaturation(_) => Category::OxygenSaturation,
            CategorySummary::Hydration(_) => Category::Hydration,
            CategorySummary::TotalCalories(_) => Category::TotalCalories,
            CategorySummary::BodyTemperature(_) => Category::BodyTemperature,
        }
    }

    /// Number of day entries, `lastSleep` excluded.
    pub fn day_count(&self) -> usize {
        match self {
            CategorySummary::Sleep(s) => s.days.len(),
            CategorySummary::HeartRate(d) => d.len(),
            CategorySummary::Steps(d) => d.len(),
            CategorySummary::Weight(d)
            | CategorySummary::OxygenSaturation(d)
            | CategorySummary::BodyTemperature(d) => d.len(),
            CategorySummary::Exercise(d) => d.len(),
            CategorySummary::Hydration(d) | CategorySummary::TotalCalories(d) => d.len(),
        }
    }

    /// The JSON shape alone does not identify a category, so decoding is
    /// driven by the key the summary was stored under.
    pub fn from_value(category: Category, value: Value) -> serde_json::Result<Self> {
        fn parse<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
            serde_json::from_value(value)
        }

        Ok(match category {
            Category::Sleep => CategorySummary::Sleep(parse(value)?),
            Category::HeartRate => CategorySummary::HeartRate(parse(value)?),
            Category::Steps => CategorySummary::Steps(parse(value)?),
            Category::Weight => CategorySummary::Weight(parse(value)?),
            Category::Exercise => CategorySummary::Exercise(parse(value)?),
            Category::OxygenSaturation => CategorySummary::OxygenSaturation(parse(value)?),
            Category::Hydration => CategorySummary::Hydration(parse(value)?),
            Category::TotalCalories => CategorySummary::TotalCalories(parse(value)?),
            Category::BodyTemperature => CategorySummary::BodyTemperature(parse(value)?),
        })
    }
}

/// Composite aggregate of one sync cycle.
///
/// Every enabled category has an entry: `Some` with its summary, or `None`
/// when the source had nothing usable. Disabled categories are absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "SnapshotWire")]
pub struct HealthSnapshot {
    pub generated_at: i64,
    pub categories: BTreeMap<Category, Option<CategorySummary>>,
    pub unavailable: Vec<String>,
}

impl HealthSnapshot {
    pub fn new(generated_at: i64) -> Self {
        Self {
            generated_at,
            categories: BTreeMap::new(),
            unavailable: Vec::new(),
        }
    }

    pub fn insert(&mut self, category: Category, summary: Option<CategorySummary>) {
        self.categories.insert(category, summary);
    }

    /// Adds a reason tag once, however many times the category fails.
    pub fn mark_unavailable(&mut self, reason: &str) {
        if !self.unavailable.iter().any(|r| r == reason) {
            self.unavailable.push(reason.to_string());
        }
    }

    pub fn get(&self, category: Category) -> Option<&CategorySummary> {
        self.categories.get(&category).and_then(Option::as_ref)
    }

    pub fn contains(&self, category: Category) -> bool {
        self.categories.contains_key(&category)
    }

    pub fn sleep(&self) -> Option<&SleepSummary> {
        match self.get(Category::Sleep) {
            Some(CategorySummary::Sleep(s)) => Some(s),
            _ => None,
        }
    }

    pub fn steps(&self) -> Option<&DayMap<DayTotal<i64>>> {
        match self.get(Category::Steps) {
            Some(CategorySummary::Steps(s)) => Some(s),
            _ => None,
        }
    }

    pub fn exercise(&self) -> Option<&DayMap<ExerciseDay>> {
        match self.get(Category::Exercise) {
            Some(CategorySummary::Exercise(e)) => Some(e),
            _ => None,
        }
    }
}

impl Serialize for HealthSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.categories.len() + 2))?;
        for (category, summary) in &self.categories {
            map.serialize_entry(category.key(), summary)?;
        }
        map.serialize_entry("unavailable", &self.unavailable)?;
        map.serialize_entry("generatedAt", &self.generated_at)?;
        map.end()
    }
}

#[derive(Deserialize)]
struct SnapshotWire {
    #[serde(rename = "generatedAt")]
    generated_at: i64,
    #[serde(default)]
    unavailable: Vec<String>,
    #[serde(flatten)]
    categories: BTreeMap<Category, Option<Value>>,
}

impl TryFrom<SnapshotWire> for HealthSnapshot {
    type Error = serde_json::Error;

    fn try_from(wire: SnapshotWire) -> Result<Self, Self::Error> {
        let mut categories = BTreeMap::new();
        for (category, value) in wire.categories {
            let summary = value
                .map(|v| CategorySummary::from_value(category, v))
                .transpose()?;
            categories.insert(category, summary);
        }

        Ok(Self {
            generated_at: wire.generated_at,
            categories,
            unavailable: wire.unavailable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_keys_parse_back() {
        for category in Category::ALL {
            assert_eq!(category.key().parse::<Category>().unwrap(), category);
        }
        assert!("heartRate".parse::<Category>().is_err());
    }

    #[test]
    fn awake_stages() {
        assert!(SleepStageType::Awake.is_awake());
        assert!(SleepStageType::AwakeInBed.is_awake());
        assert!(SleepStageType::OutOfBed.is_awake());
        assert!(!SleepStageType::Deep.is_awake());
        assert!(!SleepStageType::Sleeping.is_awake());
    }

    #[test]
    fn unavailable_reasons_are_deduplicated() {
        let mut snapshot = HealthSnapshot::new(0);
        snapshot.mark_unavailable("sleep");
        snapshot.mark_unavailable("heart rate");
        snapshot.mark_unavailable("sleep");
        assert_eq!(snapshot.unavailable, vec!["sleep", "heart rate"]);
    }

    #[test]
    fn snapshot_serializes_null_for_unavailable_category() {
        let mut snapshot = HealthSnapshot::new(42);
        snapshot.insert(Category::Hydration, None);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["hydration"], Value::Null);
        assert!(json.get("steps").is_none());
        assert_eq!(json["generatedAt"], 42);
    }

    #[test]
    fn exercise_names() {
        assert_eq!(exercise_name(56), "Running");
        assert_eq!(exercise_name(36), "HIIT");
        assert_eq!(exercise_name(-1), "Unknown");
    }
}

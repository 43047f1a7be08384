// ============================================================================
// Static GTFS schedule
// ============================================================================
//
// Used when the live feed has nothing for a station. The zip is parsed once,
// flattened into `ScheduleData` and cached as JSON in the cache directory.

use crate::error::{Result, TransitError};
use crate::models::{DataSource, StationArrival, current_timestamp};
use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use log::{debug, info, warn};
use reqwest::blocking;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Seek};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use zip::ZipArchive;

const CACHE_FILE: &str = "schedule_cache.json";
const HORIZON_SECS: i64 = 2 * 3600;
const ARRIVALS_PER_GROUP: usize = 3;
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRoute {
    pub short_name: String,
    pub route_type: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTrip {
    pub route_id: String,
    pub service_id: String,
    pub headsign: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledStopTime {
    pub trip_id: String,
    /// Seconds after midnight of the service day; may exceed 24h.
    pub arrival_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    /// Monday first.
    pub weekdays: [bool; 7],
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarException {
    pub date: String,
    /// 1 = service added, 2 = service removed
    pub exception_type: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleData {
    pub routes: HashMap<String, ScheduledRoute>,
    pub stop_names: HashMap<String, String>,
    /// GTFS stop_code -> stop_id
    pub stop_codes: HashMap<String, String>,
    pub trips: HashMap<String, ScheduledTrip>,
    /// stop_id -> stop times sorted by arrival
    pub stop_times: HashMap<String, Vec<ScheduledStopTime>>,
    pub calendar: HashMap<String, ServiceCalendar>,
    pub calendar_dates: HashMap<String, Vec<CalendarException>>,
    pub cached_at: i64,
    /// Path or URL the feed was loaded from; a cache from another source is
    /// not reused.
    #[serde(default)]
    pub source: String,
}

// CSV rows, matched by header name.

#[derive(Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_short_name: String,
    #[serde(default)]
    route_long_name: String,
    #[serde(default)]
    route_type: Option<u16>,
}

#[derive(Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_code: String,
    #[serde(default)]
    stop_name: String,
}

#[derive(Deserialize)]
struct TripRow {
    route_id: String,
    service_id: String,
    trip_id: String,
    #[serde(default)]
    trip_headsign: String,
}

#[derive(Deserialize)]
struct StopTimeRow {
    trip_id: String,
    #[serde(default)]
    arrival_time: String,
    #[serde(default)]
    departure_time: String,
    stop_id: String,
}

#[derive(Deserialize)]
struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

#[derive(Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: u8,
}

fn read_rows<T: DeserializeOwned, R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    required: bool,
) -> Result<Vec<T>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(_) if !required => return Ok(Vec::new()),
        Err(e) => return Err(TransitError::MalformedResponse(format!("GTFS zip has no {}: {}", name, e))),
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| TransitError::MalformedResponse(format!("Failed to read {}: {}", name, e)))?;

    let mut rdr = csv::Reader::from_reader(contents.trim_start_matches('\u{feff}').as_bytes());
    let mut rows = Vec::new();
    let mut skipped = 0;
    for row in rdr.deserialize::<T>() {
        match row {
            Ok(row) => rows.push(row),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!("Skipped {} malformed rows in {}", skipped, name);
    }
    Ok(rows)
}

/// Parses a GTFS time (`HH:MM:SS`, hours may exceed 23) to seconds.
pub fn parse_gtfs_time(time: &str) -> Option<u32> {
    let mut parts = time.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    hours.checked_mul(3600)?.checked_add(minutes * 60 + seconds)
}

fn route_type_name(route_type: Option<u16>) -> &'static str {
    match route_type {
        Some(0) => "Streetcar",
        Some(1) => "Subway",
        Some(2) => "Rail",
        Some(3) => "Bus",
        _ => "Transit",
    }
}

impl ScheduleData {
    pub fn from_zip<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)
            .map_err(|e| TransitError::MalformedResponse(format!("Failed to open GTFS zip: {}", e)))?;

        let routes: HashMap<String, ScheduledRoute> = read_rows::<RouteRow, _>(&mut archive, "routes.txt", true)?
            .into_iter()
            .map(|r| {
                let short_name = if r.route_short_name.is_empty() { r.route_long_name } else { r.route_short_name };
                (
                    r.route_id,
                    ScheduledRoute {
                        short_name,
                        route_type: r.route_type,
                    },
                )
            })
            .collect();
        info!("   ✓ Parsed {} routes", routes.len());

        let mut stop_names = HashMap::new();
        let mut stop_codes = HashMap::new();
        for stop in read_rows::<StopRow, _>(&mut archive, "stops.txt", true)? {
            if !stop.stop_code.is_empty() {
                stop_codes.insert(stop.stop_code, stop.stop_id.clone());
            }
            stop_names.insert(stop.stop_id, stop.stop_name);
        }
        info!("   ✓ Parsed {} stops", stop_names.len());

        let trips: HashMap<String, ScheduledTrip> = read_rows::<TripRow, _>(&mut archive, "trips.txt", true)?
            .into_iter()
            .map(|t| {
                (
                    t.trip_id,
                    ScheduledTrip {
                        route_id: t.route_id,
                        service_id: t.service_id,
                        headsign: t.trip_headsign,
                    },
                )
            })
            .collect();
        info!("   ✓ Parsed {} trips", trips.len());

        let mut stop_times: HashMap<String, Vec<ScheduledStopTime>> = HashMap::new();
        for row in read_rows::<StopTimeRow, _>(&mut archive, "stop_times.txt", true)? {
            let time = if row.arrival_time.is_empty() { &row.departure_time } else { &row.arrival_time };
            if let Some(arrival_secs) = parse_gtfs_time(time) {
                stop_times.entry(row.stop_id).or_default().push(ScheduledStopTime {
                    trip_id: row.trip_id,
                    arrival_secs,
                });
            }
        }
        for times in stop_times.values_mut() {
            times.sort_by_key(|t| t.arrival_secs);
        }
        info!(
            "   ✓ Parsed {} stop time entries",
            stop_times.values().map(|v| v.len()).sum::<usize>()
        );

        let calendar = read_rows::<CalendarRow, _>(&mut archive, "calendar.txt", false)?
            .into_iter()
            .map(|c| {
                let weekdays = [c.monday, c.tuesday, c.wednesday, c.thursday, c.friday, c.saturday, c.sunday]
                    .map(|d| d == 1);
                (
                    c.service_id,
                    ServiceCalendar {
                        weekdays,
                        start_date: c.start_date,
                        end_date: c.end_date,
                    },
                )
            })
            .collect();

        let mut calendar_dates: HashMap<String, Vec<CalendarException>> = HashMap::new();
        for row in read_rows::<CalendarDateRow, _>(&mut archive, "calendar_dates.txt", false)? {
            calendar_dates.entry(row.service_id).or_default().push(CalendarException {
                date: row.date,
                exception_type: row.exception_type,
            });
        }

        Ok(ScheduleData {
            routes,
            stop_names,
            stop_codes,
            trips,
            stop_times,
            calendar,
            calendar_dates,
            cached_at: current_timestamp(),
            source: String::new(),
        })
    }

    /// Exceptions on the exact date win; otherwise the weekly calendar within
    /// its date range. `weekday` counts from Monday = 0.
    pub fn is_service_active(&self, service_id: &str, date: &str, weekday: usize) -> bool {
        if let Some(exception) = self
            .calendar_dates
            .get(service_id)
            .and_then(|exceptions| exceptions.iter().find(|e| e.date == date))
        {
            return exception.exception_type == 1;
        }

        match self.calendar.get(service_id) {
            Some(cal) => {
                date >= cal.start_date.as_str()
                    && date <= cal.end_date.as_str()
                    && cal.weekdays.get(weekday).copied().unwrap_or(false)
            }
            None => false,
        }
    }

    fn resolve_stop<'a>(&'a self, stop: &'a str) -> Option<&'a str> {
        if self.stop_times.contains_key(stop) {
            Some(stop)
        } else {
            self.stop_codes.get(stop).map(String::as_str)
        }
    }

    /// Upcoming arrivals within the next two hours, one entry per route and
    /// headsign, earliest group first.
    pub fn scheduled_arrivals(&self, stop: &str, now: DateTime<Tz>, max_groups: usize) -> Vec<StationArrival> {
        let Some(stop_id) = self.resolve_stop(stop) else {
            return Vec::new();
        };
        let Some(times) = self.stop_times.get(stop_id) else {
            return Vec::new();
        };

        let today = now.format("%Y%m%d").to_string();
        let weekday = now.weekday().num_days_from_monday() as usize;
        let now_secs = i64::from(now.num_seconds_from_midnight());
        let station_name = self.stop_names.get(stop_id).cloned().unwrap_or_else(|| stop.to_string());

        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), (Option<u16>, Vec<f64>)> = HashMap::new();

        // `times` is sorted, so groups are created in order of first arrival
        for stop_time in times {
            let delta = i64::from(stop_time.arrival_secs) - now_secs;
            if delta <= 0 || delta > HORIZON_SECS || delta >= SECONDS_PER_DAY {
                continue;
            }

            let Some(trip) = self.trips.get(&stop_time.trip_id) else {
                continue;
            };
            if !self.is_service_active(&trip.service_id, &today, weekday) {
                continue;
            }

            let route = self.routes.get(&trip.route_id);
            let name = route.map(|r| r.short_name.clone()).unwrap_or_else(|| trip.route_id.clone());
            let key = (name, trip.headsign.clone());

            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            let minutes = (delta as f64 / 60.0 * 10.0).round() / 10.0;
            groups
                .entry(key)
                .or_insert_with(|| (route.and_then(|r| r.route_type), Vec::new()))
                .1
                .push(minutes);
        }

        order
            .into_iter()
            .filter_map(|key| {
                let (route_type, minutes) = groups.remove(&key)?;
                let (name, headsign) = key;
                let route_name = if headsign.is_empty() { name } else { format!("{} {}", name, headsign) };
                StationArrival::from_minutes(
                    route_name,
                    route_type_name(route_type),
                    station_name.clone(),
                    minutes,
                    ARRIVALS_PER_GROUP,
                    DataSource::StaticSchedule,
                    now.timestamp(),
                )
            })
            .take(max_groups)
            .collect()
    }
}

/// Lazily loaded schedule. A failed load leaves the schedule disabled until
/// the process restarts.
pub struct StaticSchedule {
    source: String,
    cache_path: PathBuf,
    max_age_days: i64,
    timeout: Duration,
    data: OnceLock<Option<ScheduleData>>,
}

impl StaticSchedule {
    pub fn new(source: &str, cache_dir: impl Into<PathBuf>, max_age_days: i64, timeout: Duration) -> Self {
        StaticSchedule {
            source: source.to_string(),
            cache_path: cache_dir.into().join(CACHE_FILE),
            max_age_days,
            timeout,
            data: OnceLock::new(),
        }
    }

    pub fn data(&self) -> Option<&ScheduleData> {
        self.data
            .get_or_init(|| match self.load() {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("⚠️  Static schedule disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    pub fn scheduled_arrivals(&self, stop: &str, now: DateTime<Tz>, max_groups: usize) -> Vec<StationArrival> {
        self.data()
            .map(|data| data.scheduled_arrivals(stop, now, max_groups))
            .unwrap_or_default()
    }

    fn load(&self) -> Result<ScheduleData> {
        if let Some(cached) = self.load_cache() {
            return Ok(cached);
        }

        info!("📥 Loading GTFS schedule from {}...", self.source);
        let mut data = ScheduleData::from_zip(Cursor::new(self.fetch()?))?;
        data.source = self.source.clone();

        if let Err(e) = self.save_cache(&data) {
            warn!("⚠️  Could not save schedule cache: {}", e);
        }
        Ok(data)
    }

    fn fetch(&self) -> Result<bytes::Bytes> {
        if !self.source.starts_with("http://") && !self.source.starts_with("https://") {
            return Ok(bytes::Bytes::from(fs::read(&self.source)?));
        }

        let client = blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(&self.source)
            .send()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to download GTFS: {}", e)))?;

        if !response.status().is_success() {
            return Err(TransitError::UpstreamUnavailable(format!(
                "GTFS download failed with status: {}",
                response.status()
            )));
        }

        let zip_bytes = response.bytes()?;
        info!("✓ Downloaded {} KB, extracting...", zip_bytes.len() / 1024);
        Ok(zip_bytes)
    }

    fn load_cache(&self) -> Option<ScheduleData> {
        let contents = fs::read_to_string(&self.cache_path).ok()?;
        match serde_json::from_str::<ScheduleData>(&contents) {
            Ok(data) if data.source != self.source => {
                info!("⚠️  Schedule cache was built from {:?}, reloading from {}", data.source, self.source);
                None
            }
            Ok(data) => {
                let age_days = current_timestamp().saturating_sub(data.cached_at) / SECONDS_PER_DAY;
                if age_days >= self.max_age_days {
                    info!("⚠️  Schedule cache expired ({} days old), refreshing...", age_days);
                    return None;
                }
                info!("✓ Schedule cache loaded ({} days old, {} trips)", age_days, data.trips.len());
                Some(data)
            }
            Err(e) => {
                warn!("⚠️  Failed to parse schedule cache ({}), will refresh", e);
                None
            }
        }
    }

    fn save_cache(&self, data: &ScheduleData) -> Result<()> {
        if let Some(dir) = self.cache_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.cache_path, serde_json::to_string_pretty(data)?)?;
        info!("✓ Schedule cache saved to: {:?}", self.cache_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Toronto;
    use std::io::Write;
    use zip::write::FileOptions;

    fn gtfs_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn sample_zip() -> Vec<u8> {
        gtfs_zip(&[
            (
                "routes.txt",
                "route_id,agency_id,route_short_name,route_long_name,route_type\n\
                 R504,1,504,KING,0\n\
                 R29,1,29,DUFFERIN,3\n",
            ),
            (
                "stops.txt",
                "stop_id,stop_code,stop_name,stop_lat,stop_lon\n\
                 14257,5292,King St West At Spadina Ave,43.6456,-79.3952\n",
            ),
            (
                "trips.txt",
                "route_id,service_id,trip_id,trip_headsign,direction_id\n\
                 R504,WKDY,t1,East to Broadview,0\n\
                 R504,WKDY,t2,East to Broadview,0\n\
                 R504,WKDY,t3,East to Broadview,0\n\
                 R504,WKDY,t4,East to Broadview,0\n\
                 R504,WKDY,t5,East to Broadview,0\n\
                 R504,WKDY,t6,East to Broadview,0\n\
                 R29,SUN,t7,South to Exhibition,1\n\
                 R29,XTRA,t8,South to Exhibition,1\n",
            ),
            (
                "stop_times.txt",
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
                 t1,07:55:00,07:55:00,14257,1\n\
                 t2,08:05:30,08:05:30,14257,1\n\
                 t3,08:12:00,08:12:00,14257,1\n\
                 t4,08:20:00,08:20:00,14257,1\n\
                 t5,08:30:00,08:30:00,14257,1\n\
                 t6,10:30:00,10:30:00,14257,1\n\
                 t7,08:10:00,08:10:00,14257,1\n\
                 t8,08:15:00,08:15:00,14257,1\n",
            ),
            (
                "calendar.txt",
                "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
                 WKDY,1,1,1,1,1,0,0,20250101,20251231\n\
                 SUN,0,0,0,0,0,0,1,20250101,20251231\n",
            ),
            (
                "calendar_dates.txt",
                "service_id,date,exception_type\n\
                 XTRA,20250303,1\n\
                 WKDY,20250304,2\n",
            ),
        ])
    }

    fn sample_data() -> ScheduleData {
        ScheduleData::from_zip(Cursor::new(sample_zip())).unwrap()
    }

    #[test]
    fn test_parse_gtfs_time() {
        assert_eq!(parse_gtfs_time("08:05:30"), Some(29_130));
        assert_eq!(parse_gtfs_time("25:10:00"), Some(90_600));
        assert_eq!(parse_gtfs_time("8:05"), None);
        assert_eq!(parse_gtfs_time("aa:00:00"), None);
        assert_eq!(parse_gtfs_time("08:75:00"), None);
        assert_eq!(parse_gtfs_time("4000000000:00:00"), None);
        assert_eq!(parse_gtfs_time("1193046:28:15"), Some(u32::MAX));
        assert_eq!(parse_gtfs_time("1193047:00:00"), None);
    }

    #[test]
    fn test_service_calendar_and_exceptions() {
        let data = sample_data();
        // Monday 2025-03-03
        assert!(data.is_service_active("WKDY", "20250303", 0));
        assert!(data.is_service_active("XTRA", "20250303", 0));
        assert!(!data.is_service_active("SUN", "20250303", 0));
        // Removed by exception on Tuesday 2025-03-04
        assert!(!data.is_service_active("WKDY", "20250304", 1));
        // Outside the calendar range
        assert!(!data.is_service_active("WKDY", "20260105", 0));
    }

    #[test]
    fn test_scheduled_arrivals_grouped_within_horizon() {
        let data = sample_data();
        let now = Toronto.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();

        // stop_code resolves to the GTFS stop_id
        let arrivals = data.scheduled_arrivals("5292", now, 10);

        assert_eq!(arrivals.len(), 2);
        assert_eq!(arrivals[0].route_name, "504 East to Broadview");
        assert_eq!(arrivals[0].route_type, "Streetcar");
        assert_eq!(arrivals[0].station_name, "King St West At Spadina Ave");
        assert_eq!(arrivals[0].next_arrivals, vec![5.5, 12.0, 20.0]);
        assert_eq!(arrivals[0].closest_arrival, 5.5);
        assert_eq!(arrivals[0].data_source, DataSource::StaticSchedule);

        assert_eq!(arrivals[1].route_name, "29 South to Exhibition");
        assert_eq!(arrivals[1].next_arrivals, vec![15.0]);
    }

    #[test]
    fn test_no_service_day_yields_nothing() {
        let data = sample_data();
        let tuesday = Toronto.with_ymd_and_hms(2025, 3, 4, 8, 0, 0).unwrap();
        assert!(data.scheduled_arrivals("14257", tuesday, 10).is_empty());
        assert!(data.scheduled_arrivals("unknown", tuesday, 10).is_empty());
    }

    #[test]
    fn test_schedule_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("gtfs.zip");
        fs::write(&zip_path, sample_zip()).unwrap();

        let schedule = StaticSchedule::new(zip_path.to_str().unwrap(), dir.path(), 7, Duration::from_secs(5));
        assert!(schedule.data().is_some());
        assert!(dir.path().join(CACHE_FILE).exists());

        // A second instance reads the JSON cache even after the zip is gone
        fs::remove_file(&zip_path).unwrap();
        let reloaded = StaticSchedule::new(zip_path.to_str().unwrap(), dir.path(), 7, Duration::from_secs(5));
        assert_eq!(reloaded.data().unwrap().trips.len(), 8);
    }

    #[test]
    fn test_cache_from_another_source_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("gtfs.zip");
        fs::write(&zip_path, sample_zip()).unwrap();
        let schedule = StaticSchedule::new(zip_path.to_str().unwrap(), dir.path(), 7, Duration::from_secs(5));
        assert!(schedule.data().is_some());

        let other_path = dir.path().join("other.zip");
        fs::write(
            &other_path,
            gtfs_zip(&[
                ("routes.txt", "route_id,route_short_name,route_type\nR1,1,1\n"),
                ("stops.txt", "stop_id,stop_name\n1,Kipling Station\n"),
                ("trips.txt", "route_id,service_id,trip_id\nR1,WKDY,only\n"),
                ("stop_times.txt", "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n"),
            ]),
        )
        .unwrap();

        let switched = StaticSchedule::new(other_path.to_str().unwrap(), dir.path(), 7, Duration::from_secs(5));
        let data = switched.data().unwrap();
        assert_eq!(data.trips.len(), 1);
        assert_eq!(data.source, other_path.to_str().unwrap());
    }

    #[test]
    fn test_unreadable_source_disables_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = StaticSchedule::new("/nonexistent/gtfs.zip", dir.path(), 7, Duration::from_secs(5));
        let now = Toronto.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();

        assert!(schedule.data().is_none());
        assert!(schedule.scheduled_arrivals("5292", now, 5).is_empty());
    }
}

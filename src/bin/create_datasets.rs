use std::path::PathBuf;

use chrono::NaiveDate;
use rail_features::{
    create_datasets, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, BankHolidaysJsonFeed, CsvFeed, ExpandedScheduleFeed, FeedSource,
    Holiday, IncidentRecord, LocationMapping, PipelineInputs, ScheduleRecord, TrainHop,
    WeatherRecord,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let mut args = std::env::args().skip(1);
    let (Some(start), Some(end)) = (args.next(), args.next()) else {
        return Err("usage: create_datasets <start YYYY-MM-DD> <end YYYY-MM-DD>".into());
    };
    let start_date = NaiveDate::parse_from_str(&start, "%Y-%m-%d")?;
    let end_date = NaiveDate::parse_from_str(&end, "%Y-%m-%d")?;

    let cfg = pipeline_config_from_env()?;
    let input_root = std::env::var("RAIL_FEATURES_INPUT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/inputs"));
    let input = |var: &str, default: &str| {
        std::env::var(var)
            .map(PathBuf::from)
            .unwrap_or_else(|_| input_root.join(default))
    };

    let train_hops: Box<dyn FeedSource<TrainHop>> =
        match std::env::var("RAIL_FEATURES_SCHEDULES_CSV") {
            Ok(path) => Box::new(ExpandedScheduleFeed::new(Box::new(
                CsvFeed::<ScheduleRecord>::new("schedules", path),
            ))),
            Err(_) => Box::new(CsvFeed::<TrainHop>::new(
                "train_hops",
                input("RAIL_FEATURES_TRAIN_HOPS_CSV", "train_hops.csv"),
            )),
        };
    let holidays_path = input("RAIL_FEATURES_HOLIDAYS_JSON", "bank-holidays.json");
    let holidays: Option<Box<dyn FeedSource<Holiday>>> = if holidays_path.exists() {
        Some(Box::new(BankHolidaysJsonFeed::new(
            holidays_path,
            std::env::var("RAIL_FEATURES_HOLIDAY_DIVISION").ok(),
        )))
    } else {
        None
    };

    let inputs = PipelineInputs {
        mappings: Box::new(CsvFeed::<LocationMapping>::new(
            "location_mappings",
            input("RAIL_FEATURES_MAPPINGS_CSV", "location_mappings.csv"),
        )),
        weather: Box::new(CsvFeed::<WeatherRecord>::new(
            "weather",
            input("RAIL_FEATURES_WEATHER_CSV", "weather.csv"),
        )),
        train_hops,
        incidents: Box::new(CsvFeed::<IncidentRecord>::new(
            "incidents",
            input("RAIL_FEATURES_INCIDENTS_CSV", "incidents.csv"),
        )),
        holidays,
    };

    println!(
        "Creating datasets {} -> {} | inputs={} output={}",
        start_date,
        end_date,
        input_root.display(),
        cfg.output.root.display()
    );

    let report = create_datasets(start_date, end_date, &cfg, &inputs)?;

    println!(
        "Done | windows={} segments={} hours={} rows={} partitions={} fingerprint={}",
        report.windows,
        report.segments,
        report.hours,
        report.rows,
        report.committed_partitions.len(),
        report.schema.fingerprint
    );
    println!(
        "  weather: stations_with_data={} segments_without_station={} out_of_range={} dropped={}",
        report.weather.stations_with_data,
        report.weather.segments_without_station,
        report.weather.out_of_range_rows,
        report.weather.mapping.dropped_rows
    );
    println!(
        "  trains: counted={} dropped={}",
        report.trains.counted_rows, report.trains.mapping.dropped_rows
    );
    println!(
        "  incidents: counted={} duplicates={} dropped={}",
        report.incidents.counted_incidents,
        report.incidents.duplicate_rows,
        report.incidents.mapping.dropped_rows
    );
    for sample in report
        .weather
        .mapping
        .samples
        .iter()
        .chain(&report.trains.mapping.samples)
        .chain(&report.incidents.mapping.samples)
    {
        println!("  dropped: {sample}");
    }

    Ok(())
}

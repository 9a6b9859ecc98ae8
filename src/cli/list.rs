use serde::de::DeserializeOwned;
use table::{Align, IntoTable, Table};
mod table;

use crate::{
    registry::{ModelSummary, ProviderSummary},
    ListArgs, ListObject, ListingFormat,
};

use die::die;

const PROVIDERS_ENDPOINT: &str = "/api/providers";
const MODELS_ENDPOINT: &str = "/api/models";

impl From<Vec<ProviderSummary>> for Table {
    fn from(value: Vec<ProviderSummary>) -> Self {
        let mut tab = Table::with_header(vec!["ADDRESS", "LOAD", "TPS", "HEALTH", "MODELS"]);

        tab.align(1, Align::Right);
        tab.align(2, Align::Right);

        for provider in value {
            let models: Vec<&str> = provider
                .models
                .iter()
                .map(|m| m.display_name.as_str())
                .collect();

            tab.add_row(vec![
                provider.address.clone(),
                format!("{}/{}", provider.current_load, provider.max_clients),
                format!("{:.1}", provider.avg_tokens_per_second),
                provider.health.to_string(),
                if models.is_empty() {
                    "-".to_string()
                } else {
                    models.join(",")
                },
            ]);
        }

        tab
    }
}

impl From<Vec<ModelSummary>> for Table {
    fn from(value: Vec<ModelSummary>) -> Self {
        let mut tab = Table::with_header(vec![
            "MODEL",
            "QUANTIZATION",
            "CONTEXT",
            "RELEASED",
            "PROVIDERS",
        ]);

        tab.align(2, Align::Right);

        for model in value {
            tab.add_row(vec![
                model.name,
                model.quantization,
                model.context_length.to_string(),
                model.release_date.format("%Y-%m-%d").to_string(),
                model.providers.join(","),
            ]);
        }

        tab
    }
}

/// Fetches one of the snapshot views from a running broker.
async fn fetch<T: DeserializeOwned>(base: &str, endpoint: &str) -> Result<T, reqwest::Error> {
    let url = format!("{}{}", base.trim_end_matches('/'), endpoint);

    reqwest::get(url).await?.error_for_status()?.json().await
}

fn format_output<O: IntoTable + serde::Serialize>(object: O, format: ListingFormat) {
    match format {
        ListingFormat::Json => match serde_json::to_string_pretty(&object) {
            Ok(output) => println!("{}", output),
            Err(err) => die!("failed to serialize listing: {}", err),
        },
        ListingFormat::Table => {
            let tab = object.into_table();

            print!("{}", tab);
        }
        ListingFormat::HeaderlessTable => {
            let mut tab = object.into_table();

            tab.print_header(false);

            print!("{}", tab);
        }
    }
}

pub(crate) async fn list_cmd(args: &ListArgs) {
    let format = args.format;

    match &args.object {
        ListObject::Models => match fetch::<Vec<ModelSummary>>(&args.url, MODELS_ENDPOINT).await {
            Ok(models) => format_output(models, format),
            Err(err) => die!("failed to list models: {}", err),
        },
        ListObject::Providers => {
            match fetch::<Vec<ProviderSummary>>(&args.url, PROVIDERS_ENDPOINT).await {
                Ok(providers) => format_output(providers, format),
                Err(err) => die!("failed to list providers: {}", err),
            }
        }
    }
}

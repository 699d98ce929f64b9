//! Country identification: name, slug and ISO3 lookups down to uppercase ISO2.
//!
//! Every lookup returns a two-letter code. When no table entry matches, a
//! deterministic guess is derived from the input so one odd upstream row
//! never fails a whole batch.

/// Countries monitored when no explicit list is configured.
pub const DEFAULT_MONITOR_COUNTRIES: [&str; 30] = [
    "DE", "ES", "PT", "US", "GB", "FR", "IT", "NL", "BE", "AT", "CH", "PL", "CZ", "HU", "HR",
    "GR", "CY", "MT", "EE", "LV", "LT", "SK", "SI", "BG", "RO", "IE", "LU", "DK", "SE", "FI",
];

/// Path slugs on the UK travel-advice API covering the EU plus Switzerland.
pub const FCDO_EU_SLUGS: [&str; 28] = [
    "germany",
    "spain",
    "portugal",
    "france",
    "italy",
    "netherlands",
    "belgium",
    "austria",
    "switzerland",
    "poland",
    "czech-republic",
    "hungary",
    "croatia",
    "greece",
    "cyprus",
    "malta",
    "estonia",
    "latvia",
    "lithuania",
    "slovakia",
    "slovenia",
    "bulgaria",
    "romania",
    "ireland",
    "luxembourg",
    "denmark",
    "sweden",
    "finland",
];

const NAME_TO_ISO2: &[(&str, &str)] = &[
    ("Germany", "DE"),
    ("Spain", "ES"),
    ("Portugal", "PT"),
    ("United States", "US"),
    ("United Kingdom", "GB"),
    ("France", "FR"),
    ("Italy", "IT"),
    ("Netherlands", "NL"),
    ("Belgium", "BE"),
    ("Austria", "AT"),
    ("Switzerland", "CH"),
    ("Poland", "PL"),
    ("Czech Republic", "CZ"),
    ("Czechia", "CZ"),
    ("Hungary", "HU"),
    ("Croatia", "HR"),
    ("Greece", "GR"),
    ("Cyprus", "CY"),
    ("Malta", "MT"),
    ("Estonia", "EE"),
    ("Latvia", "LV"),
    ("Lithuania", "LT"),
    ("Slovakia", "SK"),
    ("Slovenia", "SI"),
    ("Bulgaria", "BG"),
    ("Romania", "RO"),
    ("Ireland", "IE"),
    ("Luxembourg", "LU"),
    ("Denmark", "DK"),
    ("Sweden", "SE"),
    ("Finland", "FI"),
    ("Canada", "CA"),
    ("Australia", "AU"),
    ("New Zealand", "NZ"),
    ("Japan", "JP"),
    ("South Korea", "KR"),
    ("Singapore", "SG"),
    ("Hong Kong", "HK"),
    ("Taiwan", "TW"),
    ("Thailand", "TH"),
    ("Malaysia", "MY"),
    ("Indonesia", "ID"),
    ("Philippines", "PH"),
    ("Vietnam", "VN"),
    ("India", "IN"),
    ("China", "CN"),
    ("Brazil", "BR"),
    ("Mexico", "MX"),
    ("Argentina", "AR"),
    ("Chile", "CL"),
    ("Colombia", "CO"),
    ("Peru", "PE"),
    ("Uruguay", "UY"),
    ("Paraguay", "PY"),
    ("Ecuador", "EC"),
    ("Bolivia", "BO"),
    ("Venezuela", "VE"),
    ("South Africa", "ZA"),
    ("Egypt", "EG"),
    ("Morocco", "MA"),
    ("Tunisia", "TN"),
    ("Turkey", "TR"),
    ("Israel", "IL"),
    ("Jordan", "JO"),
    ("Lebanon", "LB"),
    ("UAE", "AE"),
    ("United Arab Emirates", "AE"),
    ("Qatar", "QA"),
    ("Saudi Arabia", "SA"),
    ("Kuwait", "KW"),
    ("Bahrain", "BH"),
    ("Oman", "OM"),
    ("Russia", "RU"),
    ("Ukraine", "UA"),
    ("Belarus", "BY"),
    ("Moldova", "MD"),
    ("Georgia", "GE"),
    ("Armenia", "AM"),
    ("Azerbaijan", "AZ"),
    ("Kazakhstan", "KZ"),
    ("Uzbekistan", "UZ"),
    ("Kyrgyzstan", "KG"),
    ("Tajikistan", "TJ"),
    ("Turkmenistan", "TM"),
    ("Mongolia", "MN"),
    ("North Korea", "KP"),
];

const SLUG_TO_ISO2: &[(&str, &str)] = &[
    ("germany", "DE"),
    ("spain", "ES"),
    ("portugal", "PT"),
    ("france", "FR"),
    ("italy", "IT"),
    ("netherlands", "NL"),
    ("belgium", "BE"),
    ("austria", "AT"),
    ("switzerland", "CH"),
    ("poland", "PL"),
    ("czech-republic", "CZ"),
    ("hungary", "HU"),
    ("croatia", "HR"),
    ("greece", "GR"),
    ("cyprus", "CY"),
    ("malta", "MT"),
    ("estonia", "EE"),
    ("latvia", "LV"),
    ("lithuania", "LT"),
    ("slovakia", "SK"),
    ("slovenia", "SI"),
    ("bulgaria", "BG"),
    ("romania", "RO"),
    ("ireland", "IE"),
    ("luxembourg", "LU"),
    ("denmark", "DK"),
    ("sweden", "SE"),
    ("finland", "FI"),
    ("usa", "US"),
    ("united-states", "US"),
    ("canada", "CA"),
    ("australia", "AU"),
    ("new-zealand", "NZ"),
    ("japan", "JP"),
    ("south-korea", "KR"),
    ("singapore", "SG"),
    ("hong-kong", "HK"),
    ("taiwan", "TW"),
    ("thailand", "TH"),
    ("malaysia", "MY"),
    ("indonesia", "ID"),
    ("philippines", "PH"),
    ("vietnam", "VN"),
    ("india", "IN"),
    ("china", "CN"),
    ("brazil", "BR"),
    ("mexico", "MX"),
    ("argentina", "AR"),
    ("chile", "CL"),
    ("colombia", "CO"),
    ("peru", "PE"),
    ("uruguay", "UY"),
    ("paraguay", "PY"),
    ("ecuador", "EC"),
    ("bolivia", "BO"),
    ("venezuela", "VE"),
    ("south-africa", "ZA"),
    ("egypt", "EG"),
    ("morocco", "MA"),
    ("tunisia", "TN"),
    ("turkey", "TR"),
    ("israel", "IL"),
    ("jordan", "JO"),
    ("lebanon", "LB"),
    ("uae", "AE"),
    ("united-arab-emirates", "AE"),
    ("qatar", "QA"),
    ("saudi-arabia", "SA"),
    ("kuwait", "KW"),
    ("bahrain", "BH"),
    ("oman", "OM"),
    ("russia", "RU"),
    ("ukraine", "UA"),
    ("belarus", "BY"),
    ("moldova", "MD"),
    ("georgia", "GE"),
    ("armenia", "AM"),
    ("azerbaijan", "AZ"),
    ("kazakhstan", "KZ"),
    ("uzbekistan", "UZ"),
    ("kyrgyzstan", "KG"),
    ("tajikistan", "TJ"),
    ("turkmenistan", "TM"),
    ("mongolia", "MN"),
    ("north-korea", "KP"),
];

const ISO3_TO_ISO2: &[(&str, &str)] = &[
    ("DEU", "DE"),
    ("ESP", "ES"),
    ("PRT", "PT"),
    ("USA", "US"),
    ("GBR", "GB"),
    ("FRA", "FR"),
    ("ITA", "IT"),
    ("NLD", "NL"),
    ("BEL", "BE"),
    ("AUT", "AT"),
    ("CHE", "CH"),
    ("POL", "PL"),
    ("CZE", "CZ"),
    ("HUN", "HU"),
    ("HRV", "HR"),
    ("GRC", "GR"),
    ("CYP", "CY"),
    ("MLT", "MT"),
    ("EST", "EE"),
    ("LVA", "LV"),
    ("LTU", "LT"),
    ("SVK", "SK"),
    ("SVN", "SI"),
    ("BGR", "BG"),
    ("ROU", "RO"),
    ("IRL", "IE"),
    ("LUX", "LU"),
    ("DNK", "DK"),
    ("SWE", "SE"),
    ("FIN", "FI"),
    ("CAN", "CA"),
    ("AUS", "AU"),
    ("NZL", "NZ"),
    ("JPN", "JP"),
    ("KOR", "KR"),
    ("CHN", "CN"),
    ("IND", "IN"),
    ("BRA", "BR"),
    ("MEX", "MX"),
    ("TUR", "TR"),
    ("NOR", "NO"),
    ("ISL", "IS"),
];

/// Deterministic two-letter guess: the first two ASCII letters, uppercased,
/// padded with `X` when the input has fewer than two.
pub fn best_effort_iso2(raw: &str) -> String {
    let mut code: String = raw
        .chars()
        .filter(char::is_ascii_alphabetic)
        .take(2)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    while code.len() < 2 {
        code.push('X');
    }
    code
}

/// Map an English country name to ISO2, falling back to [`best_effort_iso2`].
pub fn country_name_to_iso2(name: &str) -> String {
    let name = name.trim();
    NAME_TO_ISO2
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, code)| (*code).to_string())
        .unwrap_or_else(|| best_effort_iso2(name))
}

/// Map a UK travel-advice path slug to ISO2, falling back to [`best_effort_iso2`].
pub fn slug_to_iso2(slug: &str) -> String {
    let slug = slug.trim().to_ascii_lowercase();
    SLUG_TO_ISO2
        .iter()
        .find(|(s, _)| *s == slug)
        .map(|(_, code)| (*code).to_string())
        .unwrap_or_else(|| best_effort_iso2(&slug))
}

pub fn iso3_to_iso2(code: &str) -> Option<&'static str> {
    let code = code.trim();
    ISO3_TO_ISO2
        .iter()
        .find(|(iso3, _)| iso3.eq_ignore_ascii_case(code))
        .map(|(_, iso2)| *iso2)
}

/// Accept an explicit code field: two letters pass through uppercased, known
/// ISO3 codes are translated, anything else is rejected.
pub fn normalize_iso2(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    match candidate.len() {
        2 if candidate.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(candidate.to_ascii_uppercase())
        }
        3 => iso3_to_iso2(candidate).map(str::to_string),
        _ => None,
    }
}

/// Resolve a country from identification strategies ordered most specific
/// first. The first candidate that normalizes wins; otherwise the first
/// non-empty candidate is guessed from; otherwise `XX`.
pub fn resolve_iso2(candidates: &[Option<&str>]) -> String {
    let present = || {
        candidates
            .iter()
            .flatten()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    };
    present()
        .find_map(normalize_iso2)
        .or_else(|| present().next().map(best_effort_iso2))
        .unwrap_or_else(|| "XX".to_string())
}

use proptest::prelude::*;
use serde_json::json;

use osmrag_llm::extract::recover_json;
use osmrag_llm::schema::validate_value;
use osmrag_llm::{LlmSignal, RecoveryTier};

fn answer() -> impl Strategy<Value = serde_json::Value> {
    ("[a-z_]{1,12}", "[a-z_]{1,16}", prop::option::of("[A-Z][a-z]{2,10}"), 0u32..=100).prop_map(
        |(key, value, place, percent)| {
            json!({
                "place": place,
                "tag": { "key": key, "value": value },
                "confidence": f64::from(percent) / 100.0,
                "explanation": "generated"
            })
        },
    )
}

proptest! {
    #[test]
    fn object_survives_surrounding_prose(
        obj in answer(),
        prefix in "[a-zA-Z .,!:]{0,40}",
        suffix in "[a-zA-Z .,!:]{0,40}",
    ) {
        let text = format!("{prefix}{obj}{suffix}");
        let (recovered, _tier) = recover_json(&text).expect("object should be recovered");
        prop_assert_eq!(recovered, obj);
    }

    #[test]
    fn fenced_block_is_preferred_over_brace_span(
        obj in answer(),
        prose in "[a-zA-Z .,!:]{1,40}",
    ) {
        let text = format!("{prose}\n```json\n{obj}\n```\nHope this helps {{not json}}");
        let (recovered, tier) = recover_json(&text).expect("fenced block should be recovered");
        prop_assert_eq!(tier, RecoveryTier::FencedBlock);
        prop_assert_eq!(recovered, obj);
    }

    #[test]
    fn recovered_answers_validate_to_their_tag(obj in answer()) {
        match validate_value(&obj) {
            LlmSignal::Valid(r) => {
                prop_assert_eq!(r.tag.key.as_str(), obj["tag"]["key"].as_str().unwrap());
                prop_assert_eq!(r.tag.value.as_str(), obj["tag"]["value"].as_str().unwrap());
                prop_assert_eq!(r.place.as_deref(), obj["place"].as_str());
            }
            other => prop_assert!(false, "expected valid signal, got {:?}", other),
        }
    }
}

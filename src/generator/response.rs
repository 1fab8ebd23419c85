use serde_json::{Value, json};

pub const DEFAULT_MODEL: &str = "gpt-5-nano-2025-08-07";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/responses";

/// Sent ahead of every user prompt.
pub const INSTRUCTIONS: &str = r#"You are a music theory-aware assistant that generates MIDI note sequences for a DAW plugin.

You MUST return ONLY valid JSON in the exact format below.
Do NOT include explanations, comments, or extra text.

Output format:
{
  "notes": [
    {
      "start_beats": 0.0,
      "duration_beats": 0.5,
      "midi_note": 60,
      "velocity": 100
    }
  ]
}

Timing rules:
- 1 beat = 1 quarter note
- start_beats and duration_beats are in beats
- Notes should align to a regular rhythmic grid unless syncopation is intentional
- Do NOT skip beats unless musically justified

Pitch rules:
- midi_note must be an integer between 0 and 127
- velocity must be an integer between 1 and 127
- If a key or scale is specified, ALL midi_note values MUST belong to that scale
- Use correct music theory for scales and chords

Harmony rules:
- Chords are represented as multiple notes with the same start_beats
- Chord tones must belong to the specified key
- Avoid dissonant or out-of-key notes unless explicitly requested

Structure rules:
- Generate a coherent musical phrase (e.g., 1-6 bars)
- Melody and chords should feel intentional and related
- Avoid random or erratic note placement

Creativity rule:
- Be musically creative ONLY within the constraints above."#;

pub fn request_body(model: &str, prompt: &str) -> String {
    json!({
        "model": model,
        "input": format!("{INSTRUCTIONS}\n\nUser prompt:\n{prompt}"),
        "text": { "format": { "type": "json_object" } },
    })
    .to_string()
}

/// Pulls the generated text out of a responses-API envelope:
/// `output[i].content[0].text` for the first item whose `type` is
/// `"message"`. `None` if any level is missing or the text is empty.
pub fn extract_output_text(raw: &str) -> Option<String> {
    let envelope: Value = serde_json::from_str(raw).ok()?;
    let output = envelope.get("output")?.as_array()?;

    for item in output {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(first) = item
            .get("content")
            .and_then(Value::as_array)
            .and_then(|content| content.first())
        else {
            continue;
        };
        if !first.is_object() {
            continue;
        }
        let text = first.get("text").and_then(Value::as_str).unwrap_or_default();
        return (!text.is_empty()).then(|| text.to_string());
    }

    None
}

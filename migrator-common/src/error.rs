// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Renders a value (typically a config struct or an error) with any
/// credential-shaped fields masked, so it is safe to log or return to a
/// caller.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    /// Same as [`SafeDisplay::to_safe_string`] but with every line indented
    /// by two spaces, for nesting inside another `SafeDisplay` impl.
    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
